use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Command metadata key set when a command caused a deployment to be created.
pub const METADATA_TRIGGERED_DEPLOYMENT_ID: &str = "TriggeredDeploymentID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    SyncApplication,
    CancelDeployment,
    ApproveStage,
    RestartPiped,
    ChainSyncApplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    #[default]
    NotHandledYet,
    Succeeded,
    Failed,
}

impl CommandStatus {
    pub fn is_handled(&self) -> bool {
        !matches!(self, CommandStatus::NotHandledYet)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncApplicationCommand {
    pub application_id: String,
    #[serde(default)]
    pub sync_strategy: super::deployment::SyncStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSyncApplicationCommand {
    pub deployment_chain_id: String,
    pub block_index: u32,
    pub application_id: String,
    #[serde(default)]
    pub sync_strategy: super::deployment::SyncStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub piped_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub stage_id: String,
    pub r#type: CommandType,
    #[serde(default)]
    pub commander: String,
    #[serde(default)]
    pub handled: bool,
    #[serde(default)]
    pub status: CommandStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub output_blob_key: String,
    #[serde(default)]
    pub handled_at: i64,
    #[serde(default)]
    pub sync_application: Option<SyncApplicationCommand>,
    #[serde(default)]
    pub chain_sync_application: Option<ChainSyncApplicationCommand>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Command {
    /// Checks the handled invariant: `handled == (handled_at > 0) == status.is_handled()`.
    pub fn is_consistent(&self) -> bool {
        self.handled == (self.handled_at > 0) && self.handled == self.status.is_handled()
    }

    pub fn is_sync_application(&self) -> bool {
        self.r#type == CommandType::SyncApplication
    }

    pub fn is_chain_sync_application(&self) -> bool {
        self.r#type == CommandType::ChainSyncApplication
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        Command {
            id: "c".to_string(),
            piped_id: "p".to_string(),
            project_id: String::new(),
            application_id: String::new(),
            deployment_id: String::new(),
            stage_id: String::new(),
            r#type: CommandType::CancelDeployment,
            commander: "u1".to_string(),
            handled: false,
            status: CommandStatus::NotHandledYet,
            metadata: HashMap::new(),
            output_blob_key: String::new(),
            handled_at: 0,
            sync_application: None,
            chain_sync_application: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn handled_invariant() {
        let mut c = command();
        assert!(c.is_consistent());
        c.handled = true;
        assert!(!c.is_consistent());
        c.handled_at = 10;
        c.status = CommandStatus::Succeeded;
        assert!(c.is_consistent());
    }

    #[test]
    fn command_type_wire_names() {
        let json = serde_json::to_string(&CommandType::ChainSyncApplication).unwrap();
        assert_eq!(json, "\"CHAIN_SYNC_APPLICATION\"");
    }
}
