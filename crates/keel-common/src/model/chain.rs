use serde::{Deserialize, Serialize};

use super::application::ApplicationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "PENDING",
            ChainStatus::Running => "RUNNING",
            ChainStatus::Success => "SUCCESS",
            ChainStatus::Failure => "FAILURE",
            ChainStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainApplicationRef {
    pub application_id: String,
    pub application_name: String,
    pub application_kind: ApplicationKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDeploymentRef {
    pub deployment_id: String,
    pub status: super::deployment::DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    pub application_ref: ChainApplicationRef,
    #[serde(default)]
    pub deployment_ref: Option<ChainDeploymentRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub nodes: Vec<ChainNode>,
    #[serde(default)]
    pub status: ChainStatus,
}

impl ChainBlock {
    pub fn is_completed(&self) -> bool {
        matches!(
            self.status,
            ChainStatus::Success | ChainStatus::Failure | ChainStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentChain {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub status: ChainStatus,
    pub blocks: Vec<ChainBlock>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl DeploymentChain {
    /// A block may start once every block before it succeeded.
    pub fn is_block_plannable(&self, index: usize) -> bool {
        if index >= self.blocks.len() {
            return false;
        }
        self.blocks[..index]
            .iter()
            .all(|b| b.status == ChainStatus::Success)
    }
}
