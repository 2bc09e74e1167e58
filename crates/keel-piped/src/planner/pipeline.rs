use async_trait::async_trait;
use keel_common::{config::GenericInput, model::ApplicationKind, time::now_unix};

use super::{
    decide_strategy, pipeline_stages, quick_sync_stages, short_hash, Planner, PlannerInput,
    PlannerOutput, Strategy,
};
use crate::error::KeelPipedResult;

/// Planner of the kinds that have no kind specific signal to look at: once
/// nothing forces quick sync, the configured pipeline is used.
pub struct GenericPlanner {
    kind: ApplicationKind,
}

impl GenericPlanner {
    pub fn new(kind: ApplicationKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Planner for GenericPlanner {
    async fn plan(&self, input: &PlannerInput) -> KeelPipedResult<PlannerOutput> {
        let cfg = &input.target.app_config;
        let auto_rollback = cfg.input::<GenericInput>()?.auto_rollback;
        let now = now_unix();
        let strategy = decide_strategy(input)?.unwrap_or_else(|| {
            Strategy::Pipeline("Sync with the specified pipeline".to_string())
        });
        let (stages, summary) = match strategy {
            Strategy::Quick(summary) => (quick_sync_stages(self.kind, auto_rollback, now), summary),
            Strategy::Pipeline(summary) => {
                (pipeline_stages(self.kind, cfg, auto_rollback, now), summary)
            }
        };
        Ok(PlannerOutput {
            stages,
            summary,
            version: short_hash(&input.deployment.trigger.commit.hash).to_string(),
        })
    }
}
