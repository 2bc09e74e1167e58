use std::{collections::BTreeMap, sync::Arc};

use keel_common::model::{ApplicationLiveStateSnapshot, ResourceEventType, ResourceStateEvent};
use tokio::sync::Mutex;

use crate::{error::KeelDatabaseResult, filestore::FileStore};

pub fn live_state_path(application_id: &str) -> String {
    format!("state/{}/snapshot.json", application_id)
}

/// Latest live-state snapshot per application, patched by resource events.
#[derive(Clone)]
pub struct LiveStateStore {
    fs: Arc<dyn FileStore>,
    write_lock: Arc<Mutex<()>>,
}

impl LiveStateStore {
    pub fn new(fs: Arc<dyn FileStore>) -> Self {
        Self {
            fs,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn get_snapshot(
        &self,
        application_id: &str,
    ) -> KeelDatabaseResult<ApplicationLiveStateSnapshot> {
        let data = self.fs.get(&live_state_path(application_id)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn put_snapshot(&self, snapshot: &ApplicationLiveStateSnapshot) -> KeelDatabaseResult {
        let _guard = self.write_lock.lock().await;
        self.write(snapshot).await
    }

    async fn write(&self, snapshot: &ApplicationLiveStateSnapshot) -> KeelDatabaseResult {
        let data = serde_json::to_vec(snapshot)?;
        self.fs
            .put(&live_state_path(&snapshot.application_id), &data)
            .await
    }

    /// Applies events to the stored snapshots of their applications.
    ///
    /// Events older than the snapshot they target are dropped. Returns the ids
    /// of the events that could not be applied, e.g. because no snapshot was
    /// stored yet for their application.
    pub async fn apply_events(&self, events: &[ResourceStateEvent]) -> Vec<String> {
        let _guard = self.write_lock.lock().await;
        let mut by_app: BTreeMap<&str, Vec<&ResourceStateEvent>> = BTreeMap::new();
        for e in events {
            by_app.entry(e.application_id.as_str()).or_default().push(e);
        }

        let mut failed = Vec::new();
        for (app_id, events) in by_app {
            let mut snapshot = match self.get_snapshot(app_id).await {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(application_id = app_id, "unable to load live state snapshot: {}", err);
                    failed.extend(events.iter().map(|e| e.id.clone()));
                    continue;
                }
            };
            let mut changed = false;
            for event in &events {
                if event.snapshot_version.is_before(&snapshot.version) {
                    continue;
                }
                let existing = snapshot.resources.iter().position(|r| r.id == event.state.id);
                match (event.r#type, existing) {
                    (ResourceEventType::Deleted, Some(i)) => {
                        snapshot.resources.remove(i);
                    }
                    (ResourceEventType::Deleted, None) => continue,
                    (_, Some(i)) => snapshot.resources[i] = event.state.clone(),
                    (_, None) => snapshot.resources.push(event.state.clone()),
                }
                changed = true;
            }
            if !changed {
                continue;
            }
            snapshot.determine_health_status();
            if let Err(err) = self.write(&snapshot).await {
                tracing::error!(application_id = app_id, "unable to store live state snapshot: {}", err);
                failed.extend(events.iter().map(|e| e.id.clone()));
            }
        }
        failed
    }
}
