use async_trait::async_trait;
use keel_common::{config::Duration, model::StageStatus, time::now_unix};
use serde::Deserialize;
use tracing::warn;

use super::{Executor, ExecutorInput, StopSignal};

const METADATA_START_TIME: &str = "startTime";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitStageOptions {
    #[serde(default)]
    pub duration: Duration,
}

/// Sleeps for the configured duration. The start time is kept in the stage
/// metadata so a restarted agent only waits for what is left.
pub struct WaitExecutor;

#[async_trait]
impl Executor for WaitExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageStatus {
        let opts: WaitStageOptions = match input.stage_config.options() {
            Ok(o) => o,
            Err(e) => {
                input.log.error(format!("Invalid stage options: {}", e));
                return StageStatus::Failure;
            }
        };
        let metadata = input.metadata.stage(&input.stage.id);
        let now = now_unix();
        let started_at = match metadata
            .get(METADATA_START_TIME)
            .and_then(|v| v.parse::<i64>().ok())
        {
            Some(t) => t,
            None => {
                if let Err(e) = metadata.put(METADATA_START_TIME, &now.to_string()).await {
                    warn!(stage_id = %input.stage.id, "failed to save wait start time: {}", e);
                }
                now
            }
        };

        let elapsed = std::time::Duration::from_secs((now - started_at).max(0) as u64);
        let remaining = opts.duration.as_std().saturating_sub(elapsed);
        if elapsed.is_zero() {
            input.log.info(format!("Waiting for {}...", opts.duration));
        } else {
            input.log.info(format!(
                "Waiting for {} ({}s already elapsed)...",
                opts.duration,
                elapsed.as_secs()
            ));
        }

        tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                input.log.success(format!("Waited for {}", opts.duration));
                StageStatus::Success
            }
            s = sig.stopped() => {
                input.log.info("Wait was interrupted");
                s.stage_status()
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

    fn wait_config(duration: &str) -> PipelineStageConfig {
        PipelineStageConfig {
            name: stage::WAIT.to_string(),
            with: serde_yaml::from_str(&format!("duration: {}", duration)).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn waits_and_records_the_start_time() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let source = testing::source(&repo, &[("app.keel.yaml", APP)]).await;
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::WAIT, 0, &[]),
            wait_config("1s"),
            source,
            None,
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        assert_eq!(WaitExecutor.execute(&input, sig).await, StageStatus::Success);
        assert!(input.metadata.stage("s1").get(METADATA_START_TIME).is_some());
    }

    #[tokio::test]
    async fn cancel_interrupts_the_wait() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let source = testing::source(&repo, &[("app.keel.yaml", APP)]).await;
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::WAIT, 0, &[]),
            wait_config("1h"),
            source,
            None,
        )
        .await;
        let (sig, handler) = new_stop_signal();
        let run = WaitExecutor.execute(&input, sig);
        let cancel = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            handler.cancel();
        };
        let (status, _) = tokio::join!(run, cancel);
        assert_eq!(status, StageStatus::Cancelled);
    }
}
