use std::{collections::HashMap, sync::Arc, time::Duration};

use keel_common::{model::Application, rpc::PipedService};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{poll, Snapshot};
use crate::{
    apiclient::{rpc_retry, with_retry},
    error::KeelPipedResult,
};

const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Enabled applications of this piped that match its app selector.
pub struct ApplicationStore {
    client: Arc<dyn PipedService>,
    app_selector: HashMap<String, String>,
    apps: Snapshot<Application>,
}

impl ApplicationStore {
    pub fn new(client: Arc<dyn PipedService>, app_selector: HashMap<String, String>) -> Self {
        Self {
            client,
            app_selector,
            apps: Snapshot::new(),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        poll("application", SYNC_INTERVAL, token, || self.sync()).await
    }

    pub async fn sync(&self) -> KeelPipedResult {
        let resp = with_retry(&rpc_retry(), |_| self.client.list_applications()).await?;
        let apps: Vec<Application> = resp
            .applications
            .into_iter()
            .filter(|a| {
                self.app_selector
                    .iter()
                    .all(|(k, v)| a.labels.get(k) == Some(v))
            })
            .collect();
        debug!(count = apps.len(), "refreshed applications");
        metrics::gauge!("keel_piped_applications").set(apps.len() as f64);
        self.apps.store(apps);
        Ok(())
    }

    pub fn list(&self) -> Arc<Vec<Application>> {
        self.apps.load()
    }

    pub fn get(&self, id: &str) -> Option<Application> {
        self.apps.load().iter().find(|a| a.id == id).cloned()
    }

    pub fn list_by_platform_provider(&self, name: &str) -> Vec<Application> {
        self.apps
            .load()
            .iter()
            .filter(|a| a.platform_provider == name)
            .cloned()
            .collect()
    }

    pub fn list_by_repo(&self, repo_id: &str) -> Vec<Application> {
        self.apps
            .load()
            .iter()
            .filter(|a| a.git_path.repo.id == repo_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{app, ControlPlane, PROVIDER};

    #[tokio::test]
    async fn keeps_apps_matching_the_selector() {
        let cp = ControlPlane::new().await;
        cp.add_app(&app("a1", "app/A", "")).await;
        let mut other = app("a2", "app/B", "");
        other.labels.insert("env".to_string(), "prod".to_string());
        other.platform_provider = "other".to_string();
        cp.add_app(&other).await;

        let store = ApplicationStore::new(cp.client(), HashMap::new());
        store.sync().await.unwrap();
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.list_by_platform_provider(PROVIDER).len(), 1);
        assert_eq!(store.list_by_repo("repo-1").len(), 2);

        let selector = HashMap::from([("env".to_string(), "dev".to_string())]);
        let store = ApplicationStore::new(cp.client(), selector);
        store.sync().await.unwrap();
        let ids: Vec<String> = store.list().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec!["a1".to_string()]);
        assert!(store.get("a2").is_none());
    }
}
