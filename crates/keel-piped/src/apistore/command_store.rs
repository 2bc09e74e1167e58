use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashSet;
use keel_common::{
    model::{Command, CommandStatus, CommandType},
    rpc::{PipedService, ReportCommandHandledRequest},
    time::now_unix,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{poll, Snapshot};
use crate::{
    apiclient::{rpc_retry, with_retry},
    error::KeelPipedResult,
};

const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Unhandled commands addressed to this piped.
///
/// Commands acknowledged through [`CommandStore::report_command_handled`]
/// disappear locally right away, even before the next refresh.
pub struct CommandStore {
    client: Arc<dyn PipedService>,
    commands: Snapshot<Command>,
    handled: DashSet<String>,
}

impl CommandStore {
    pub fn new(client: Arc<dyn PipedService>) -> Self {
        Self {
            client,
            commands: Snapshot::new(),
            handled: DashSet::new(),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        poll("command", SYNC_INTERVAL, token, || self.sync()).await
    }

    pub async fn sync(&self) -> KeelPipedResult {
        let resp = with_retry(&rpc_retry(), |_| self.client.list_unhandled_commands()).await?;
        let commands = resp.commands;
        self.handled
            .retain(|id| commands.iter().any(|c| &c.id == id));
        let commands = commands
            .into_iter()
            .filter(|c| !self.handled.contains(&c.id))
            .collect();
        self.commands.store(commands);
        Ok(())
    }

    fn list_by<F: Fn(&Command) -> bool>(&self, f: F) -> Vec<Command> {
        self.commands.load().iter().filter(|c| f(c)).cloned().collect()
    }

    pub fn list_application_commands(&self) -> Vec<Command> {
        self.list_by(|c| c.r#type == CommandType::SyncApplication)
    }

    pub fn list_chain_sync_commands(&self) -> Vec<Command> {
        self.list_by(|c| c.r#type == CommandType::ChainSyncApplication)
    }

    pub fn list_cancel_commands(&self) -> Vec<Command> {
        self.list_by(|c| c.r#type == CommandType::CancelDeployment)
    }

    pub fn list_restart_commands(&self) -> Vec<Command> {
        self.list_by(|c| c.r#type == CommandType::RestartPiped)
    }

    pub fn cancel_command_for(&self, deployment_id: &str) -> Option<Command> {
        self.list_cancel_commands()
            .into_iter()
            .find(|c| c.deployment_id == deployment_id)
    }

    pub fn approve_commands(&self, deployment_id: &str, stage_id: &str) -> Vec<Command> {
        self.list_by(|c| {
            c.r#type == CommandType::ApproveStage
                && c.deployment_id == deployment_id
                && c.stage_id == stage_id
        })
    }

    /// Acknowledges a command and forgets it locally.
    pub async fn report_command_handled(
        &self,
        cmd: &Command,
        status: CommandStatus,
        metadata: HashMap<String, String>,
        output: Option<String>,
    ) -> KeelPipedResult {
        let req = ReportCommandHandledRequest {
            command_id: cmd.id.clone(),
            status,
            metadata,
            handled_at: now_unix(),
            output,
        };
        with_retry(&rpc_retry(), |_| {
            self.client.report_command_handled(req.clone())
        })
        .await?;
        info!(command_id = %cmd.id, command_type = ?cmd.r#type, ?status, "command has been handled");
        self.handled.insert(cmd.id.clone());
        self.commands.update(|cmds| cmds.retain(|c| c.id != cmd.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{command, ControlPlane};

    #[tokio::test]
    async fn lists_by_type_and_forgets_handled_commands() {
        let cp = ControlPlane::new().await;
        cp.add_deployment("d1", &["s1"]).await;
        let mut cancel = command("c1", CommandType::CancelDeployment);
        cancel.deployment_id = "d1".to_string();
        cancel.application_id = "a1".to_string();
        cp.add_command(&cancel).await;
        let mut approve = command("c2", CommandType::ApproveStage);
        approve.deployment_id = "d1".to_string();
        approve.stage_id = "s1".to_string();
        approve.application_id = "a1".to_string();
        cp.add_command(&approve).await;

        let store = CommandStore::new(cp.client());
        store.sync().await.unwrap();
        assert_eq!(store.cancel_command_for("d1").unwrap().id, "c1");
        assert!(store.cancel_command_for("d2").is_none());
        assert_eq!(store.approve_commands("d1", "s1").len(), 1);
        assert!(store.list_application_commands().is_empty());

        store
            .report_command_handled(&cancel, CommandStatus::Succeeded, HashMap::new(), None)
            .await
            .unwrap();
        assert!(store.cancel_command_for("d1").is_none());
        store.sync().await.unwrap();
        assert!(store.cancel_command_for("d1").is_none());

        let stored = cp.stores().commands.get("c1").await.unwrap();
        assert!(stored.handled);
        assert_eq!(stored.status, CommandStatus::Succeeded);
    }
}
