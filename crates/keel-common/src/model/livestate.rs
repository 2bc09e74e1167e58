use serde::{Deserialize, Serialize};

use super::application::ApplicationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct LiveStateVersion {
    pub timestamp: i64,
    pub index: i64,
}

impl LiveStateVersion {
    pub fn is_before(&self, other: &LiveStateVersion) -> bool {
        (self.timestamp, self.index) < (other.timestamp, other.index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    #[serde(default)]
    pub owner_ids: Vec<String>,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    pub name: String,
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub health_description: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationLiveStateSnapshot {
    pub application_id: String,
    pub piped_id: String,
    pub project_id: String,
    #[serde(default)]
    pub env_id: String,
    pub kind: ApplicationKind,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub resources: Vec<ResourceState>,
    #[serde(default)]
    pub version: LiveStateVersion,
}

impl ApplicationLiveStateSnapshot {
    /// Derives the application health from its resource tree.
    pub fn determine_health_status(&mut self) {
        self.health_status = if self.resources.is_empty() {
            HealthStatus::Unknown
        } else if self
            .resources
            .iter()
            .all(|r| r.health_status == HealthStatus::Healthy)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceEventType {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStateEvent {
    pub id: String,
    pub application_id: String,
    pub piped_id: String,
    pub project_id: String,
    pub r#type: ResourceEventType,
    pub state: ResourceState,
    pub snapshot_version: LiveStateVersion,
    pub created_at: i64,
}
