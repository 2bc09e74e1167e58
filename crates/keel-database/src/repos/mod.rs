//! Typed façades over the [`DataStore`] and [`FileStore`], one per record kind.
pub mod analysis_store;
pub mod application_store;
pub mod chain_store;
pub mod command_store;
pub mod deployment_store;
pub mod environment_store;
pub mod event_store;
pub mod live_state_store;
pub mod piped_store;
pub mod stage_log_store;

use std::{marker::PhantomData, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};

pub use analysis_store::AnalysisResultStore;
pub use application_store::ApplicationStore;
pub use chain_store::DeploymentChainStore;
pub use command_store::CommandStore;
pub use deployment_store::DeploymentStore;
pub use environment_store::EnvironmentStore;
pub use event_store::EventStore;
pub use live_state_store::LiveStateStore;
pub use piped_store::PipedStore;
pub use stage_log_store::StageLogStore;

use crate::{
    datastore::{DataStore, Kind, ListOptions},
    error::{KeelDatabaseError, KeelDatabaseResult},
    filestore::FileStore,
};

const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Serde view of one record kind in a [`DataStore`].
pub struct Collection<T> {
    ds: Arc<dyn DataStore>,
    kind: Kind,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            ds: self.ds.clone(),
            kind: self.kind,
            _record: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(ds: Arc<dyn DataStore>, kind: Kind) -> Self {
        Self {
            ds,
            kind,
            _record: PhantomData,
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<T> {
        let doc = self.ds.get(self.kind, id).await?;
        Ok(serde_json::from_value(doc.data)?)
    }

    pub async fn create(&self, id: &str, record: &T) -> KeelDatabaseResult {
        self.ds
            .create(self.kind, id, serde_json::to_value(record)?)
            .await
            .map(|_| ())
    }

    pub async fn put(&self, id: &str, record: &T) -> KeelDatabaseResult {
        self.ds
            .put(self.kind, id, serde_json::to_value(record)?)
            .await
            .map(|_| ())
    }

    pub async fn list(&self, opts: &ListOptions) -> KeelDatabaseResult<Vec<T>> {
        self.ds
            .list(self.kind, opts)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc.data).map_err(KeelDatabaseError::from))
            .collect()
    }

    /// Read-modify-write of one record.
    ///
    /// `updater` returns whether it changed the record; unchanged records are
    /// not written back. Lost compare-and-swap races are retried against the
    /// fresh record.
    pub async fn update<F>(&self, id: &str, mut updater: F) -> KeelDatabaseResult<T>
    where
        F: FnMut(&mut T) -> KeelDatabaseResult<bool> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let doc = self.ds.get(self.kind, id).await?;
            let mut record: T = serde_json::from_value(doc.data)?;
            if !updater(&mut record)? {
                return Ok(record);
            }
            let data = serde_json::to_value(&record)?;
            match self.ds.update(self.kind, id, doc.version, data).await {
                Ok(_) => return Ok(record),
                Err(KeelDatabaseError::VersionConflict(what)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    tracing::debug!(kind = %self.kind, id, attempt, "retrying conflicting update of {}", what);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Every store the control plane works with, sharing one datastore and one file store.
#[derive(Clone)]
pub struct Stores {
    pub applications: ApplicationStore,
    pub deployments: DeploymentStore,
    pub commands: CommandStore,
    pub events: EventStore,
    pub pipeds: PipedStore,
    pub environments: EnvironmentStore,
    pub chains: DeploymentChainStore,
    pub stage_logs: StageLogStore,
    pub live_states: LiveStateStore,
    pub analysis_results: AnalysisResultStore,
}

impl Stores {
    pub fn new(ds: Arc<dyn DataStore>, fs: Arc<dyn FileStore>) -> Self {
        Self {
            applications: ApplicationStore::new(ds.clone()),
            deployments: DeploymentStore::new(ds.clone()),
            commands: CommandStore::new(ds.clone(), fs.clone()),
            events: EventStore::new(ds.clone()),
            pipeds: PipedStore::new(ds.clone()),
            environments: EnvironmentStore::new(ds.clone()),
            chains: DeploymentChainStore::new(ds),
            stage_logs: StageLogStore::new(fs.clone()),
            live_states: LiveStateStore::new(fs.clone()),
            analysis_results: AnalysisResultStore::new(fs),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use keel_common::model::{Application, Deployment, DeploymentStatus, PipelineStage};

    use super::Stores;
    use crate::{datastore::MemoryDataStore, filestore::LocalFileStore};

    pub fn stores(dir: &tempfile::TempDir) -> Stores {
        Stores::new(
            Arc::new(MemoryDataStore::new()),
            Arc::new(LocalFileStore::new(dir.path())),
        )
    }

    pub fn app(id: &str, piped: &str) -> Application {
        Application {
            id: id.to_string(),
            name: id.to_string(),
            project_id: "proj".to_string(),
            piped_id: piped.to_string(),
            ..Default::default()
        }
    }

    pub fn stage(id: &str, requires: &[&str]) -> PipelineStage {
        PipelineStage {
            id: id.to_string(),
            name: "WAIT".to_string(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            visible: true,
            ..Default::default()
        }
    }

    pub fn deployment(id: &str, app_id: &str, piped: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            application_id: app_id.to_string(),
            piped_id: piped.to_string(),
            project_id: "proj".to_string(),
            status: DeploymentStatus::Pending,
            ..Default::default()
        }
    }
}
