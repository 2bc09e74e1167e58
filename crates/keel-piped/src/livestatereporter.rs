//! Sends the live state of the applications to the control plane: a full
//! snapshot every ten minutes and the resource changes every five seconds.
use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use keel_common::{
    model::{Application, LiveStateVersion, ResourceStateEvent},
    rpc::{
        PipedService, ReportApplicationLiveStateEventsRequest, ReportApplicationLiveStateRequest,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::ApplicationStore,
    error::KeelPipedResult,
    livestatestore::{EventIterator, Registry},
};

const SNAPSHOT_FLUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);
const EVENT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_EVENTS_PER_REQUEST: usize = 1000;

pub struct Reporter {
    client: Arc<dyn PipedService>,
    apps: Arc<ApplicationStore>,
    stores: Registry,
    piped_id: String,
    project_id: String,
    // Version of the last snapshot sent per application.
    reported: DashMap<String, LiveStateVersion>,
}

impl Reporter {
    pub fn new(
        client: Arc<dyn PipedService>,
        apps: Arc<ApplicationStore>,
        stores: Registry,
        project_id: &str,
        piped_id: &str,
    ) -> Self {
        Self {
            client,
            apps,
            stores,
            piped_id: piped_id.to_string(),
            project_id: project_id.to_string(),
            reported: DashMap::new(),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        info!("live state reporter has been started");
        let mut iterators = self.iterators();
        let mut snapshots = tokio::time::interval(SNAPSHOT_FLUSH_INTERVAL);
        let mut events = tokio::time::interval(EVENT_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = snapshots.tick() => self.flush_snapshots().await,
                _ = events.tick() => self.flush_events(&mut iterators).await,
            }
        }
        info!("live state reporter has been stopped");
        Ok(())
    }

    pub fn iterators(&self) -> Vec<(String, EventIterator)> {
        self.stores
            .iter()
            .map(|(provider, store)| (provider.clone(), store.event_iterator()))
            .collect()
    }

    pub async fn flush_snapshots(&self) {
        for (provider, store) in self.stores.iter() {
            for app in self.apps.list_by_platform_provider(provider) {
                let mut snapshot = store.snapshot(&app.id);
                snapshot.piped_id = self.piped_id.clone();
                snapshot.project_id = self.project_id.clone();
                snapshot.env_id = app.env_id.clone();
                snapshot.kind = app.kind;
                snapshot.determine_health_status();
                let version = snapshot.version;
                let req = ReportApplicationLiveStateRequest { snapshot };
                match with_retry(&rpc_retry(), |_| {
                    self.client.report_application_live_state(req.clone())
                })
                .await
                {
                    Ok(_) => {
                        self.reported.insert(app.id.clone(), version);
                    }
                    Err(e) => {
                        warn!(application_id = %app.id, "failed to report application live state: {}", e)
                    }
                }
            }
        }
    }

    pub async fn flush_events(&self, iterators: &mut [(String, EventIterator)]) {
        for (provider, it) in iterators.iter_mut() {
            loop {
                let events = it.next(MAX_EVENTS_PER_REQUEST);
                let exhausted = events.len() < MAX_EVENTS_PER_REQUEST;
                let events: Vec<ResourceStateEvent> = events
                    .into_iter()
                    .filter(|e| self.should_report(provider, e))
                    .map(|mut e| {
                        e.piped_id = self.piped_id.clone();
                        e.project_id = self.project_id.clone();
                        e
                    })
                    .collect();
                if !events.is_empty() {
                    self.send_events(events).await;
                }
                if exhausted {
                    break;
                }
            }
        }
    }

    fn should_report(&self, provider: &str, event: &ResourceStateEvent) -> bool {
        let owned = self
            .apps
            .get(&event.application_id)
            .is_some_and(|a: Application| a.platform_provider == provider);
        if !owned {
            return false;
        }
        match self.reported.get(&event.application_id) {
            Some(v) => !event.snapshot_version.is_before(&v),
            // No snapshot yet; the next one covers this change.
            None => false,
        }
    }

    async fn send_events(&self, events: Vec<ResourceStateEvent>) {
        let count = events.len();
        let req = ReportApplicationLiveStateEventsRequest { events };
        match with_retry(&rpc_retry(), |_| {
            self.client
                .report_application_live_state_events(req.clone())
        })
        .await
        {
            Ok(resp) if !resp.failed_ids.is_empty() => warn!(
                failed = resp.failed_ids.len(),
                "some live state events were not applied"
            ),
            Ok(_) => debug!(count, "reported live state events"),
            Err(e) => warn!(count, "failed to report live state events: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use keel_common::model::{HealthStatus, ResourceEventType};

    use super::*;
    use crate::{
        livestatestore::{resource, MemoryStore},
        testing::{app, ControlPlane, PROVIDER},
    };

    async fn fixture() -> (ControlPlane, Reporter, Arc<MemoryStore>) {
        let cp = ControlPlane::new().await;
        cp.add_app(&app("a1", "app/A", "")).await;
        let apps = Arc::new(ApplicationStore::new(cp.client(), HashMap::new()));
        apps.sync().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut stores = Registry::new();
        stores.register(PROVIDER, store.clone());
        let reporter = Reporter::new(cp.client(), apps, stores, "proj", "p1");
        (cp, reporter, store)
    }

    #[tokio::test]
    async fn snapshots_carry_the_application_health() {
        let (cp, reporter, store) = fixture().await;
        store.upsert("a1", resource("d", "Deployment", &[]), None);
        let mut pod = resource("p", "Pod", &["d"]);
        pod.health_status = HealthStatus::Unhealthy;
        store.upsert("a1", pod, None);
        // Not an application of this piped.
        store.upsert("zz", resource("x", "Deployment", &[]), None);

        reporter.flush_snapshots().await;
        let snapshot = cp.stores().live_states.get_snapshot("a1").await.unwrap();
        assert_eq!(snapshot.resources.len(), 2);
        assert_eq!(snapshot.health_status, HealthStatus::Unhealthy);
        assert!(cp.stores().live_states.get_snapshot("zz").await.is_err());
    }

    #[tokio::test]
    async fn events_after_the_snapshot_are_applied() {
        let (cp, reporter, store) = fixture().await;
        let mut iterators = reporter.iterators();
        store.upsert("a1", resource("d", "Deployment", &[]), None);
        reporter.flush_snapshots().await;

        store.upsert("a1", resource("rs", "ReplicaSet", &["d"]), None);
        store.delete("a1", "d");
        reporter.flush_events(&mut iterators).await;

        let snapshot = cp.stores().live_states.get_snapshot("a1").await.unwrap();
        let ids: Vec<&str> = snapshot.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rs"]);
    }

    #[tokio::test]
    async fn stale_events_are_suppressed() {
        let (_cp, reporter, _store) = fixture().await;
        let event = |index| ResourceStateEvent {
            id: "e".to_string(),
            application_id: "a1".to_string(),
            piped_id: String::new(),
            project_id: String::new(),
            r#type: ResourceEventType::Updated,
            state: resource("d", "Deployment", &[]),
            snapshot_version: LiveStateVersion { timestamp: 10, index },
            created_at: 10,
        };
        assert!(!reporter.should_report(PROVIDER, &event(1)), "no snapshot yet");
        reporter
            .reported
            .insert("a1".to_string(), LiveStateVersion { timestamp: 10, index: 5 });
        assert!(!reporter.should_report(PROVIDER, &event(4)));
        assert!(reporter.should_report(PROVIDER, &event(5)));
        assert!(!reporter.should_report("other", &event(6)));
    }
}
