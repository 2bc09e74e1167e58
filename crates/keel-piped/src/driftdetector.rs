//! Compares what Git says an application should run with what actually
//! runs, and reports the application as SYNCED or OUT_OF_SYNC.
//!
//! The comparison is provider specific and plugged in through [`Differ`].
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Write as _,
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use keel_common::{
    config::{load_application, GenericApplicationSpec, KubernetesInput},
    git::Client,
    model::{Application, ApplicationSyncState, ApplicationSyncStatus},
    rpc::{PipedService, ReportApplicationSyncStateRequest},
    time::now_unix,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::{ApplicationStore, DeploymentStore},
    error::KeelPipedResult,
    kubernetes::{diff_manifests, load_manifests, DiffResult, Manifest},
    livestatestore::MemoryStore,
    repocache::RepoCache,
};

const CHECK_INTERVAL: Duration = Duration::from_secs(60);
const IGNORE_DRIFT_DETECTION_ANNOTATION: &str = "keel.dev/ignore-drift-detection";

/// What a differ needs to know about one application at one commit.
pub struct DriftInput<'a> {
    pub app: &'a Application,
    pub config: &'a GenericApplicationSpec,
    pub repo_dir: &'a Path,
    pub commit: &'a str,
}

#[async_trait]
pub trait Differ: Send + Sync {
    async fn sync_state(&self, input: &DriftInput<'_>) -> KeelPipedResult<ApplicationSyncState>;
}

/// Differ of the providers without drift detection.
pub struct UnsupportedDiffer;

#[async_trait]
impl Differ for UnsupportedDiffer {
    async fn sync_state(&self, _: &DriftInput<'_>) -> KeelPipedResult<ApplicationSyncState> {
        Ok(ApplicationSyncState {
            status: ApplicationSyncStatus::Unknown,
            short_reason: "drift detection is not supported for this kind".to_string(),
            reason: String::new(),
            head_deployment_id: String::new(),
            timestamp: now_unix(),
        })
    }
}

/// Compares the manifests in Git with the live manifests of a cluster.
pub struct KubernetesDiffer {
    live: Arc<MemoryStore>,
    watched: HashSet<(String, String)>,
    default_namespace: String,
    // Manifests at HEAD by application, with the commit they were read at.
    head_cache: DashMap<String, (String, Arc<Vec<Manifest>>)>,
}

impl KubernetesDiffer {
    pub fn new(live: Arc<MemoryStore>, watched: Vec<(String, String)>, default_namespace: &str) -> Self {
        Self {
            live,
            watched: watched.into_iter().collect(),
            default_namespace: if default_namespace.is_empty() {
                "default".to_string()
            } else {
                default_namespace.to_string()
            },
            head_cache: DashMap::new(),
        }
    }

    async fn head_manifests(&self, input: &DriftInput<'_>) -> KeelPipedResult<Arc<Vec<Manifest>>> {
        if let Some(cached) = self.head_cache.get(&input.app.id) {
            if cached.0 == input.commit {
                return Ok(cached.1.clone());
            }
        }
        let k8s: KubernetesInput = input.config.input()?;
        let app_dir = input.repo_dir.join(&input.app.git_path.path);
        let mut manifests = load_manifests(&app_dir, &k8s, input.app.git_path.config_filename()).await?;
        for m in manifests.iter_mut() {
            if m.key.namespace.is_empty() && !is_cluster_scoped(&m.key.kind) {
                m.set_namespace(&self.default_namespace);
            }
        }
        let manifests = Arc::new(manifests);
        self.head_cache.insert(
            input.app.id.clone(),
            (input.commit.to_string(), manifests.clone()),
        );
        Ok(manifests)
    }
}

#[async_trait]
impl Differ for KubernetesDiffer {
    async fn sync_state(&self, input: &DriftInput<'_>) -> KeelPipedResult<ApplicationSyncState> {
        let head: Vec<Manifest> = self
            .head_manifests(input)
            .await?
            .iter()
            .filter(|m| {
                self.watched
                    .contains(&(m.key.api_version.clone(), m.key.kind.clone()))
            })
            .filter(|m| !ignores_drift(m))
            .cloned()
            .collect();
        let live: Vec<Manifest> = self
            .live
            .manifests(&input.app.id)
            .into_iter()
            .filter(|m| !ignores_drift(m))
            .collect();
        debug!(
            application_id = %input.app.id,
            head = head.len(),
            live = live.len(),
            commit = input.commit,
            "comparing manifests"
        );
        let ignore_fields = input
            .config
            .drift_detection
            .as_ref()
            .map(|d| d.ignore_fields.clone())
            .unwrap_or_default();
        let result = diff_manifests(&head, &live, &ignore_fields);
        Ok(sync_state_of(&result, input.commit))
    }
}

fn ignores_drift(m: &Manifest) -> bool {
    m.body
        .get("metadata")
        .and_then(|md| md.get("annotations"))
        .and_then(|a| a.get(IGNORE_DRIFT_DETECTION_ANNOTATION))
        .and_then(Value::as_str)
        == Some("true")
}

fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "CustomResourceDefinition"
            | "PersistentVolume"
            | "StorageClass"
    )
}

fn sync_state_of(result: &DiffResult, commit: &str) -> ApplicationSyncState {
    if result.is_empty() {
        return ApplicationSyncState {
            status: ApplicationSyncStatus::Synced,
            timestamp: now_unix(),
            ..Default::default()
        };
    }
    let short = &commit[..commit.len().min(7)];
    let mut reason = format!(
        "Diff between the running resources and the definitions in Git at commit {:?}:\n--- Git\n+++ Cluster\n\n",
        short
    );
    let marked = result
        .deletes
        .iter()
        .map(|k| ('+', k))
        .chain(result.adds.iter().map(|k| ('-', k)))
        .chain(result.changes.iter().map(|k| ('*', k)));
    for (i, (mark, key)) in marked.enumerate() {
        let _ = write!(reason, "{} {}. {}\n\n", mark, i + 1, key);
    }
    ApplicationSyncState {
        status: ApplicationSyncStatus::OutOfSync,
        short_reason: result.summary(),
        reason,
        head_deployment_id: String::new(),
        timestamp: now_unix(),
    }
}

pub struct DriftDetector {
    client: Arc<dyn PipedService>,
    apps: Arc<ApplicationStore>,
    deployments: Arc<DeploymentStore>,
    repos: RepoCache,
    differs: HashMap<String, Arc<dyn Differ>>,
}

impl DriftDetector {
    pub fn new(
        client: Arc<dyn PipedService>,
        git: Arc<Client>,
        apps: Arc<ApplicationStore>,
        deployments: Arc<DeploymentStore>,
        spec: &keel_common::config::PipedSpec,
        workspace: &Path,
    ) -> Self {
        Self {
            client,
            apps,
            deployments,
            repos: RepoCache::new(git, spec, workspace),
            differs: HashMap::new(),
        }
    }

    /// Sets the differ used for the applications of `provider`.
    pub fn register(&mut self, provider: &str, differ: Arc<dyn Differ>) {
        self.differs.insert(provider.to_string(), differ);
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        info!(providers = self.differs.len(), "drift detector has been started");
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.check().await,
            }
        }
        info!("drift detector has been stopped");
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
            let (repo, head) = match self.repos.fresh(&repo_id).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(repo_id = %repo_id, "failed to update repository: {}", e);
                    continue;
                }
            };
            for app in apps {
                if app.deploying || self.deployments.has_in_flight(&app.id) {
                    debug!(application_id = %app.id, "skipping drift detection of a deploying application");
                    continue;
                }
                if let Err(e) = self.check_application(&app, repo.path(), &head.hash).await {
                    warn!(application_id = %app.id, "failed to detect drift: {}", e);
                }
            }
        }
    }

    async fn check_application(
        &self,
        app: &Application,
        repo_dir: &Path,
        commit: &str,
    ) -> KeelPipedResult {
        let config = load_application(repo_dir, &app.git_path.config_path(), app.kind)?;
        let input = DriftInput {
            app,
            config: &config,
            repo_dir,
            commit,
        };
        let mut state = match self.differs.get(&app.platform_provider) {
            Some(differ) => differ.sync_state(&input).await?,
            None => UnsupportedDiffer.sync_state(&input).await?,
        };
        state.head_deployment_id = app
            .most_recently_successful_deployment
            .as_ref()
            .map(|d| d.deployment_id.clone())
            .unwrap_or_default();
        if !app.sync_state.has_changed(&state) {
            return Ok(());
        }
        info!(application_id = %app.id, status = ?state.status, "application sync state changed");
        let req = ReportApplicationSyncStateRequest {
            application_id: app.id.clone(),
            state,
        };
        with_retry(&rpc_retry(), |_| {
            self.client.report_application_sync_state(req.clone())
        })
        .await?;
        Ok(())
    }
}
