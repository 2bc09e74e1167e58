use std::sync::Arc;

use keel_common::{
    model::{ChainBlock, ChainDeploymentRef, ChainStatus, DeploymentChain, DeploymentStatus},
    time::now_unix,
};

use super::Collection;
use crate::{
    datastore::{DataStore, Kind},
    error::{KeelDatabaseError, KeelDatabaseResult},
};

#[derive(Clone)]
pub struct DeploymentChainStore {
    collection: Collection<DeploymentChain>,
}

fn block_status(block: &ChainBlock) -> ChainStatus {
    let statuses: Vec<DeploymentStatus> = block
        .nodes
        .iter()
        .filter_map(|n| n.deployment_ref.as_ref().map(|r| r.status))
        .collect();
    if statuses.contains(&DeploymentStatus::Failure) {
        ChainStatus::Failure
    } else if statuses.contains(&DeploymentStatus::Cancelled) {
        ChainStatus::Cancelled
    } else if !block.nodes.is_empty()
        && statuses.len() == block.nodes.len()
        && statuses.iter().all(|s| *s == DeploymentStatus::Success)
    {
        ChainStatus::Success
    } else if statuses.is_empty() {
        ChainStatus::Pending
    } else {
        ChainStatus::Running
    }
}

/// Derives block and chain statuses from the deployments of each node.
fn refresh_statuses(chain: &mut DeploymentChain) {
    for block in chain.blocks.iter_mut() {
        block.status = block_status(block);
    }
    let blocks = &chain.blocks;
    chain.status = if let Some(b) = blocks
        .iter()
        .find(|b| matches!(b.status, ChainStatus::Failure | ChainStatus::Cancelled))
    {
        b.status
    } else if blocks.iter().all(|b| b.status == ChainStatus::Success) {
        ChainStatus::Success
    } else if blocks.iter().any(|b| b.status != ChainStatus::Pending) {
        ChainStatus::Running
    } else {
        ChainStatus::Pending
    };
}

impl DeploymentChainStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            collection: Collection::new(ds, Kind::DeploymentChain),
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<DeploymentChain> {
        self.collection.get(id).await
    }

    pub async fn create(&self, chain: &DeploymentChain) -> KeelDatabaseResult<DeploymentChain> {
        if chain.id.is_empty() || chain.blocks.is_empty() {
            return Err(KeelDatabaseError::InvalidArgument(
                "deployment chain requires an id and at least one block".into(),
            ));
        }
        let mut c = chain.clone();
        refresh_statuses(&mut c);
        let now = now_unix();
        c.created_at = now;
        c.updated_at = now;
        self.collection.create(&c.id, &c).await?;
        Ok(c)
    }

    /// Links a deployment to the node of its application in the given block,
    /// or refreshes the status of an already linked deployment.
    pub async fn update_node(
        &self,
        chain_id: &str,
        block_index: u32,
        application_id: &str,
        deployment: ChainDeploymentRef,
    ) -> KeelDatabaseResult<DeploymentChain> {
        self.collection
            .update(chain_id, |chain| {
                let block = chain.blocks.get_mut(block_index as usize).ok_or_else(|| {
                    KeelDatabaseError::InvalidArgument(format!(
                        "block {} does not exist in deployment chain {}",
                        block_index, chain_id
                    ))
                })?;
                let node = block
                    .nodes
                    .iter_mut()
                    .find(|n| n.application_ref.application_id == application_id)
                    .ok_or_else(|| {
                        KeelDatabaseError::InvalidArgument(format!(
                            "application {} is not part of block {} of deployment chain {}",
                            application_id, block_index, chain_id
                        ))
                    })?;
                if node.deployment_ref.as_ref() == Some(&deployment) {
                    return Ok(false);
                }
                node.deployment_ref = Some(deployment.clone());
                refresh_statuses(chain);
                chain.updated_at = now_unix();
                Ok(true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use keel_common::model::{ApplicationKind, ChainApplicationRef, ChainNode};

    use super::*;
    use crate::repos::testing::stores;

    fn node(app: &str) -> ChainNode {
        ChainNode {
            application_ref: ChainApplicationRef {
                application_id: app.to_string(),
                application_name: app.to_string(),
                application_kind: ApplicationKind::Kubernetes,
            },
            deployment_ref: None,
        }
    }

    fn deployment(id: &str, status: DeploymentStatus) -> ChainDeploymentRef {
        ChainDeploymentRef {
            deployment_id: id.to_string(),
            status,
            status_reason: String::new(),
        }
    }

    #[tokio::test]
    async fn statuses_follow_node_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        let chain = DeploymentChain {
            id: "chain".to_string(),
            project_id: "proj".to_string(),
            blocks: vec![
                ChainBlock {
                    nodes: vec![node("a")],
                    status: ChainStatus::Pending,
                },
                ChainBlock {
                    nodes: vec![node("b"), node("c")],
                    status: ChainStatus::Pending,
                },
            ],
            ..Default::default()
        };
        s.chains.create(&chain).await.unwrap();

        let c = s
            .chains
            .update_node("chain", 0, "a", deployment("d-a", DeploymentStatus::Running))
            .await
            .unwrap();
        assert_eq!(c.blocks[0].status, ChainStatus::Running);
        assert_eq!(c.status, ChainStatus::Running);
        assert!(!c.is_block_plannable(1));

        let c = s
            .chains
            .update_node("chain", 0, "a", deployment("d-a", DeploymentStatus::Success))
            .await
            .unwrap();
        assert_eq!(c.blocks[0].status, ChainStatus::Success);
        assert!(c.is_block_plannable(1));

        s.chains
            .update_node("chain", 1, "b", deployment("d-b", DeploymentStatus::Success))
            .await
            .unwrap();
        let c = s
            .chains
            .update_node("chain", 1, "c", deployment("d-c", DeploymentStatus::Failure))
            .await
            .unwrap();
        assert_eq!(c.blocks[1].status, ChainStatus::Failure);
        assert_eq!(c.status, ChainStatus::Failure);

        let err = s
            .chains
            .update_node("chain", 5, "a", deployment("x", DeploymentStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelDatabaseError::InvalidArgument(_)));
    }
}
