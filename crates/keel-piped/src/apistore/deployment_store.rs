use std::{sync::Arc, time::Duration};

use keel_common::{
    model::{Deployment, DeploymentStatus},
    rpc::PipedService,
};
use tokio_util::sync::CancellationToken;

use super::{poll, Snapshot};
use crate::{
    apiclient::{rpc_retry, with_retry},
    error::KeelPipedResult,
};

const SYNC_INTERVAL: Duration = Duration::from_secs(15);

/// Not yet completed deployments of this piped, oldest first.
pub struct DeploymentStore {
    client: Arc<dyn PipedService>,
    deployments: Snapshot<Deployment>,
}

impl DeploymentStore {
    pub fn new(client: Arc<dyn PipedService>) -> Self {
        Self {
            client,
            deployments: Snapshot::new(),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        poll("deployment", SYNC_INTERVAL, token, || self.sync()).await
    }

    pub async fn sync(&self) -> KeelPipedResult {
        let resp = with_retry(&rpc_retry(), |_| {
            self.client.list_not_completed_deployments()
        })
        .await?;
        let mut deployments = resp.deployments;
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        self.deployments.store(deployments);
        Ok(())
    }

    fn with_status(&self, status: DeploymentStatus) -> Vec<Deployment> {
        self.deployments
            .load()
            .iter()
            .filter(|d| d.status == status)
            .cloned()
            .collect()
    }

    pub fn pending(&self) -> Vec<Deployment> {
        self.with_status(DeploymentStatus::Pending)
    }

    pub fn planned(&self) -> Vec<Deployment> {
        self.with_status(DeploymentStatus::Planned)
    }

    /// Deployments already started, including the ones rolling back.
    pub fn running(&self) -> Vec<Deployment> {
        self.deployments
            .load()
            .iter()
            .filter(|d| {
                matches!(
                    d.status,
                    DeploymentStatus::Running | DeploymentStatus::RollingBack
                )
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Deployment> {
        self.deployments.load().iter().find(|d| d.id == id).cloned()
    }

    pub fn has_in_flight(&self, application_id: &str) -> bool {
        self.deployments
            .load()
            .iter()
            .any(|d| d.application_id == application_id)
    }
}
