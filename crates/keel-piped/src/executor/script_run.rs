use std::collections::HashMap;

use async_trait::async_trait;
use keel_common::{error::KeelError, model::StageStatus, util::command::stream_command_output};
use serde::Deserialize;
use tokio::{process::Command, sync::mpsc};

use super::{Executor, ExecutorInput, StopSignal};
use crate::{planner::METADATA_BASE_STAGE_ID, toolregistry::ToolRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRunOptions {
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Script run when the deployment is rolled back.
    #[serde(default)]
    pub on_rollback: String,
}

/// Runs a user shell script inside the application directory.
pub struct ScriptRunExecutor {
    rollback: bool,
}

impl ScriptRunExecutor {
    pub fn new(rollback: bool) -> Self {
        Self { rollback }
    }

    fn envs(&self, input: &ExecutorInput, opts: &ScriptRunOptions) -> Vec<(String, String)> {
        let d = &input.deployment;
        let mut envs = vec![
            ("PATH".to_string(), ToolRegistry::global().path_env()),
            ("SR_DEPLOYMENT_ID".to_string(), d.id.clone()),
            ("SR_APPLICATION_ID".to_string(), d.application_id.clone()),
            ("SR_APPLICATION_NAME".to_string(), d.application_name.clone()),
            ("SR_TRIGGERED_COMMIT_HASH".to_string(), d.trigger.commit.hash.clone()),
            ("SR_TRIGGERED_COMMANDER".to_string(), d.trigger.commander.clone()),
            ("SR_REPOSITORY_URL".to_string(), d.git_path.repo.remote.clone()),
            ("SR_IS_ROLLBACK".to_string(), self.rollback.to_string()),
        ];
        envs.extend(opts.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        envs
    }
}

#[async_trait]
impl Executor for ScriptRunExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageStatus {
        // A rollback stage reads the options of the stage it undoes.
        let opts: ScriptRunOptions = match input.stage_config.options() {
            Ok(o) => o,
            Err(e) => {
                input.log.error(format!("Invalid stage options: {}", e));
                return StageStatus::Failure;
            }
        };
        let (script, source) = if self.rollback {
            let source = input
                .running_source
                .clone()
                .unwrap_or_else(|| input.target_source.clone());
            (opts.on_rollback.clone(), source)
        } else {
            (opts.run.clone(), input.target_source.clone())
        };
        if script.trim().is_empty() {
            if self.rollback {
                let base = input.stage.metadata.get(METADATA_BASE_STAGE_ID);
                input.log.info(format!(
                    "Nothing to roll back for stage {}",
                    base.map(String::as_str).unwrap_or("unknown")
                ));
                return StageStatus::Success;
            }
            input.log.error("The script to run is empty");
            return StageStatus::Failure;
        }

        input.log.info(format!("Running commands...\n{}", script.trim_end()));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&script).current_dir(&source.app_dir);
        for (k, v) in self.envs(input, &opts) {
            cmd.env(k, v);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = stream_command_output(cmd, tx, async {
            sig.stopped().await;
        });
        let forward = async {
            while let Some(line) = rx.recv().await {
                input.log.info(line);
            }
        };
        let (result, _) = tokio::join!(run, forward);

        match result {
            Ok(status) if status.success() => {
                input.log.success("Successfully executed the script");
                StageStatus::Success
            }
            Ok(status) => {
                input.log.error(format!("The script exited with {}", status));
                StageStatus::Failure
            }
            Err(KeelError::Interrupted) => {
                let status = sig
                    .signal()
                    .map_or(StageStatus::Cancelled, |s| s.stage_status());
                input.log.info("The script was interrupted");
                status
            }
            Err(e) => {
                input.log.error(format!("Unable to run the script: {}", e));
                StageStatus::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_common::{config::PipelineStageConfig, model::stage};

    use super::*;
    use crate::{
        executor::{new_stop_signal, testing},
        testing::{stage as stage_fixture, ControlPlane, TestRepo},
    };

    const APP: &str = "apiVersion: keel.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";

    fn script_config(with: &str) -> PipelineStageConfig {
        PipelineStageConfig {
            name: stage::SCRIPT_RUN.to_string(),
            with: serde_yaml::from_str(with).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn runs_in_the_app_dir_with_env() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let source = testing::source(&repo, &[("app.keel.yaml", APP), ("marker", "here")]).await;
        let config = script_config(
            "run: |\n  test -f marker\n  test \"$SR_DEPLOYMENT_ID\" = d1\n  test \"$GREETING\" = hi\n  test \"$SR_IS_ROLLBACK\" = false\nenv:\n  GREETING: hi\n",
        );
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::SCRIPT_RUN, 0, &[]),
            config,
            source,
            None,
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        let status = ScriptRunExecutor::new(false).execute(&input, sig).await;
        assert_eq!(status, StageStatus::Success);
    }

    #[tokio::test]
    async fn failing_scripts_fail_the_stage() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let source = testing::source(&repo, &[("app.keel.yaml", APP)]).await;
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::SCRIPT_RUN, 0, &[]),
            script_config("run: exit 3\n"),
            source,
            None,
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        let status = ScriptRunExecutor::new(false).execute(&input, sig).await;
        assert_eq!(status, StageStatus::Failure);
    }

    #[tokio::test]
    async fn cancel_kills_the_script() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let source = testing::source(&repo, &[("app.keel.yaml", APP)]).await;
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::SCRIPT_RUN, 0, &[]),
            script_config("run: sleep 30\n"),
            source,
            None,
        )
        .await;
        let (sig, handler) = new_stop_signal();
        let executor = ScriptRunExecutor::new(false);
        let run = executor.execute(&input, sig);
        let cancel = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            handler.cancel();
        };
        let (status, _) = tokio::join!(run, cancel);
        assert_eq!(status, StageStatus::Cancelled);
    }

    #[tokio::test]
    async fn rollback_runs_on_rollback() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let source = testing::source(&repo, &[("app.keel.yaml", APP)]).await;
        let input = testing::input(
            &cp,
            stage_fixture("r1", stage::SCRIPT_RUN_ROLLBACK, 0, &[]),
            script_config("run: exit 1\nonRollback: test \"$SR_IS_ROLLBACK\" = true\n"),
            source,
            None,
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        let status = ScriptRunExecutor::new(true).execute(&input, sig).await;
        assert_eq!(status, StageStatus::Success);
    }
}
