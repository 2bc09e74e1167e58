use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use keel_common::model::{CommandStatus, StageStatus};
use serde::Deserialize;
use tracing::warn;

use super::{Executor, ExecutorInput, StopSignal};

pub(super) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const METADATA_APPROVERS: &str = "Approvers";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitApprovalStageOptions {
    /// Users allowed to approve. Anyone may approve when empty.
    #[serde(default)]
    pub approvers: Vec<String>,
}

/// Blocks until an allowed user approves the stage.
pub struct WaitApprovalExecutor {
    interval: Duration,
}

impl WaitApprovalExecutor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Acknowledges every pending approval and returns the first valid approver.
    async fn check(&self, input: &ExecutorInput, opts: &WaitApprovalStageOptions) -> Option<String> {
        for cmd in input
            .commands
            .approve_commands(&input.deployment.id, &input.stage.id)
        {
            let allowed = opts.approvers.is_empty() || opts.approvers.contains(&cmd.commander);
            let status = if allowed {
                CommandStatus::Succeeded
            } else {
                input.log.info(format!(
                    "Approval from {} was ignored because they are not an approver",
                    cmd.commander
                ));
                CommandStatus::Failed
            };
            if let Err(e) = input
                .commands
                .report_command_handled(&cmd, status, HashMap::new(), None)
                .await
            {
                warn!(command_id = %cmd.id, "failed to report approve command: {}", e);
            }
            if allowed {
                return Some(cmd.commander);
            }
        }
        None
    }
}

#[async_trait]
impl Executor for WaitApprovalExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageStatus {
        let opts: WaitApprovalStageOptions = match input.stage_config.options() {
            Ok(o) => o,
            Err(e) => {
                input.log.error(format!("Invalid stage options: {}", e));
                return StageStatus::Failure;
            }
        };
        if opts.approvers.is_empty() {
            input.log.info("Waiting for an approval from anyone...");
        } else {
            input.log.info(format!(
                "Waiting for an approval from one of {}...",
                opts.approvers.join(", ")
            ));
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(approver) = self.check(input, &opts).await {
                        let metadata = input.metadata.stage(&input.stage.id);
                        if let Err(e) = metadata.put(METADATA_APPROVERS, &approver).await {
                            warn!(stage_id = %input.stage.id, "failed to save approvers: {}", e);
                        }
                        input.log.success(format!("Got an approval from {}", approver));
                        return StageStatus::Success;
                    }
                }
                s = sig.stopped() => return s.stage_status(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_common::{
        config::PipelineStageConfig,
        model::{stage, CommandType},
    };

    use super::*;
    use crate::{
        executor::{new_stop_signal, testing},
        testing::{command, stage as stage_fixture, ControlPlane, TestRepo},
    };

    const APP: &str = "apiVersion: keel.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";

    #[tokio::test]
    async fn only_listed_approvers_count() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let source = testing::source(&repo, &[("app.keel.yaml", APP)]).await;
        for (id, who) in [("c1", "mallory"), ("c2", "alice")] {
            let mut cmd = command(id, CommandType::ApproveStage);
            cmd.application_id = "a1".to_string();
            cmd.deployment_id = "d1".to_string();
            cmd.stage_id = "s1".to_string();
            cmd.commander = who.to_string();
            cp.add_command(&cmd).await;
        }
        let config = PipelineStageConfig {
            name: stage::WAIT_APPROVAL.to_string(),
            with: serde_yaml::from_str("approvers: [alice]").unwrap(),
            ..Default::default()
        };
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::WAIT_APPROVAL, 0, &[]),
            config,
            source,
            None,
        )
        .await;

        let (sig, _handler) = new_stop_signal();
        let executor = WaitApprovalExecutor::new(Duration::from_millis(10));
        assert_eq!(executor.execute(&input, sig).await, StageStatus::Success);
        assert_eq!(
            input.metadata.stage("s1").get(METADATA_APPROVERS).as_deref(),
            Some("alice")
        );
        let rejected = cp.stores().commands.get("c1").await.unwrap();
        assert_ne!(rejected.status, CommandStatus::Succeeded);
        let accepted = cp.stores().commands.get("c2").await.unwrap();
        assert_eq!(accepted.status, CommandStatus::Succeeded);
    }
}
