//! Keeps the name, labels and description of the registered applications in
//! line with their application configs in Git.
//!
//! A repository is only scanned again once its head commit has moved.
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use dashmap::DashMap;
use keel_common::{
    config::{load_application, PipedSpec},
    git::Client,
    model::Application,
    rpc::{ApplicationInfo, PipedService, UpdateApplicationConfigurationsRequest},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::ApplicationStore,
    error::KeelPipedResult,
    repocache::RepoCache,
};

pub struct AppConfigReporter {
    client: Arc<dyn PipedService>,
    apps: Arc<ApplicationStore>,
    repos: RepoCache,
    interval: Duration,
    // Head commit of each repository at its last successful report.
    last_heads: DashMap<String, String>,
}

impl AppConfigReporter {
    pub fn new(
        client: Arc<dyn PipedService>,
        git: Arc<Client>,
        apps: Arc<ApplicationStore>,
        spec: &PipedSpec,
        workspace: &Path,
    ) -> Self {
        Self {
            client,
            apps,
            repos: RepoCache::new(git, spec, workspace),
            interval: spec.sync_interval.as_std(),
            last_heads: DashMap::new(),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        info!("app config reporter has been started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.check().await,
            }
        }
        info!("app config reporter has been stopped");
        Ok(())
    }

    pub async fn check(&self) {
        let mut by_repo: BTreeMap<String, Vec<Application>> = BTreeMap::new();
        for app in self.apps.list().iter() {
            by_repo
                .entry(app.git_path.repo.id.clone())
                .or_default()
                .push(app.clone());
        }
        for (repo_id, apps) in by_repo {
            if let Err(e) = self.check_repository(&repo_id, &apps).await {
                warn!(repo_id = %repo_id, "failed to report application configurations: {}", e);
            }
        }
    }

    async fn check_repository(&self, repo_id: &str, apps: &[Application]) -> KeelPipedResult {
        let (repo, head) = self.repos.fresh(repo_id).await?;
        if self.last_heads.get(repo_id).is_some_and(|h| *h == head.hash) {
            return Ok(());
        }
        let updates: Vec<ApplicationInfo> = apps
            .iter()
            .filter_map(|app| changed_info(app, repo.path()))
            .collect();
        if !updates.is_empty() {
            let count = updates.len();
            let req = UpdateApplicationConfigurationsRequest {
                applications: updates,
            };
            with_retry(&rpc_retry(), |_| {
                self.client.update_application_configurations(req.clone())
            })
            .await?;
            info!(repo_id, count, commit = %head.hash, "application configurations have been updated");
        }
        self.last_heads.insert(repo_id.to_string(), head.hash);
        Ok(())
    }
}

/// The configuration of `app` read from Git, when it differs from what the
/// control plane has. An empty name in Git keeps the registered one.
fn changed_info(app: &Application, repo_dir: &Path) -> Option<ApplicationInfo> {
    let cfg = match load_application(repo_dir, &app.git_path.config_path(), app.kind) {
        Ok(cfg) => cfg,
        Err(e) => {
            debug!(application_id = %app.id, "skipping application config: {}", e);
            return None;
        }
    };
    let name = if cfg.name.is_empty() {
        app.name.clone()
    } else {
        cfg.name
    };
    if name == app.name && cfg.labels == app.labels && cfg.description == app.description {
        return None;
    }
    Some(ApplicationInfo {
        id: app.id.clone(),
        name,
        labels: cfg.labels,
        description: cfg.description,
    })
}
