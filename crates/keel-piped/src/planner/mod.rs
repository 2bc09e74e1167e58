//! Turns a pending deployment into the list of stages to run.
//!
//! Every application kind has a planner registered at compile time. They
//! share the strategy decision in [`decide_strategy`] and differ only in how
//! they settle the cases it leaves open.
mod kubernetes;
mod pipeline;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use keel_common::{
    model::{stage, ApplicationKind, Deployment, PipelineStage, StageStatus, SyncStrategy},
    config::GenericApplicationSpec,
};
use regex::Regex;

pub use kubernetes::KubernetesPlanner;
pub use pipeline::GenericPlanner;

use crate::{deploysource::DeploySource, error::KeelPipedResult};

pub const ROLLBACK_STAGE_ID: &str = "rollback";
pub const SCRIPT_RUN_ROLLBACK_PREFIX: &str = "script-run-rollback-";
/// Stage metadata pointing a script rollback stage at the stage it undoes.
pub const METADATA_BASE_STAGE_ID: &str = "baseStageID";

pub struct PlannerInput {
    pub deployment: Deployment,
    /// Commit of the last successful deployment, empty for the first one.
    pub running_commit: String,
    pub target: Arc<DeploySource>,
    pub running: Option<Arc<DeploySource>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlannerOutput {
    pub stages: Vec<PipelineStage>,
    pub summary: String,
    pub version: String,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: &PlannerInput) -> KeelPipedResult<PlannerOutput>;
}

#[derive(Default, Clone)]
pub struct Registry {
    planners: HashMap<ApplicationKind, Arc<dyn Planner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Planners for every supported kind.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ApplicationKind::Kubernetes, Arc::new(KubernetesPlanner));
        for kind in ApplicationKind::ALL {
            if kind != ApplicationKind::Kubernetes {
                registry.register(kind, Arc::new(GenericPlanner::new(kind)));
            }
        }
        registry
    }

    pub fn register(&mut self, kind: ApplicationKind, planner: Arc<dyn Planner>) {
        self.planners.insert(kind, planner);
    }

    pub fn planner(&self, kind: ApplicationKind) -> Option<Arc<dyn Planner>> {
        self.planners.get(&kind).cloned()
    }
}

pub fn sync_stage_name(kind: ApplicationKind) -> &'static str {
    match kind {
        ApplicationKind::Kubernetes => stage::K8S_SYNC,
        ApplicationKind::Terraform => stage::TERRAFORM_SYNC,
        ApplicationKind::Cloudrun => stage::CLOUDRUN_SYNC,
        ApplicationKind::Lambda => stage::LAMBDA_SYNC,
        ApplicationKind::Ecs => stage::ECS_SYNC,
        ApplicationKind::Crossplane => stage::CROSSPLANE_SYNC,
    }
}

pub fn rollback_stage_name(kind: ApplicationKind) -> &'static str {
    match kind {
        ApplicationKind::Kubernetes => stage::K8S_ROLLBACK,
        ApplicationKind::Terraform => stage::TERRAFORM_ROLLBACK,
        ApplicationKind::Cloudrun => stage::CLOUDRUN_ROLLBACK,
        ApplicationKind::Lambda => stage::LAMBDA_ROLLBACK,
        ApplicationKind::Ecs => stage::ECS_ROLLBACK,
        ApplicationKind::Crossplane => stage::CROSSPLANE_ROLLBACK,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Quick(String),
    Pipeline(String),
}

/// Settles the strategy when the trigger or the config dictate it.
/// `None` leaves the decision to the kind specific planner.
pub fn decide_strategy(input: &PlannerInput) -> KeelPipedResult<Option<Strategy>> {
    let cfg = &input.target.app_config;
    let trigger = &input.deployment.trigger;

    match trigger.sync_strategy {
        SyncStrategy::QuickSync => {
            return Ok(Some(Strategy::Quick(or_default(
                &trigger.strategy_summary,
                "Quick sync by applying all manifests because it was requested",
            ))))
        }
        SyncStrategy::PipelineSync if cfg.has_pipeline() => {
            return Ok(Some(Strategy::Pipeline(or_default(
                &trigger.strategy_summary,
                "Sync with the specified pipeline because it was requested",
            ))))
        }
        _ => {}
    }

    if !cfg.has_pipeline() {
        return Ok(Some(Strategy::Quick(
            "Quick sync by applying all manifests (no pipeline was configured)".to_string(),
        )));
    }

    let message = &trigger.commit.message;
    let short = short_hash(&trigger.commit.hash);
    if !cfg.commit_matcher.quick_sync.is_empty()
        && Regex::new(&cfg.commit_matcher.quick_sync)?.is_match(message)
    {
        return Ok(Some(Strategy::Quick(format!(
            "Quick sync by applying all manifests because the commit {} matches {:?}",
            short, cfg.commit_matcher.quick_sync
        ))));
    }
    if !cfg.commit_matcher.pipeline.is_empty()
        && Regex::new(&cfg.commit_matcher.pipeline)?.is_match(message)
    {
        return Ok(Some(Strategy::Pipeline(format!(
            "Sync with the specified pipeline because the commit {} matches {:?}",
            short, cfg.commit_matcher.pipeline
        ))));
    }

    if cfg.planner.always_use_pipeline {
        return Ok(Some(Strategy::Pipeline(
            "Sync with the specified pipeline (alwaysUsePipeline was set)".to_string(),
        )));
    }

    if input.running_commit.is_empty() || input.running.is_none() {
        return Ok(Some(Strategy::Quick(
            "Quick sync because this is the first deployment".to_string(),
        )));
    }
    Ok(None)
}

/// The single sync stage plus, when enabled, the hidden rollback stage.
pub fn quick_sync_stages(kind: ApplicationKind, auto_rollback: bool, now: i64) -> Vec<PipelineStage> {
    let name = sync_stage_name(kind);
    let mut stages = vec![PipelineStage {
        id: name.to_string(),
        name: name.to_string(),
        desc: "Sync by applying all manifests".to_string(),
        index: 0,
        predefined: true,
        visible: true,
        status: StageStatus::NotStartedYet,
        created_at: now,
        updated_at: now,
        ..Default::default()
    }];
    if auto_rollback {
        stages.push(rollback_stage(kind, Vec::new(), 1, now));
    }
    stages
}

/// One stage per configured pipeline stage, chained through `requires`.
pub fn pipeline_stages(
    kind: ApplicationKind,
    cfg: &GenericApplicationSpec,
    auto_rollback: bool,
    now: i64,
) -> Vec<PipelineStage> {
    let configs = cfg.pipeline.as_ref().map(|p| p.stages.as_slice()).unwrap_or_default();
    let mut stages: Vec<PipelineStage> = Vec::with_capacity(configs.len() + 1);
    let mut rollbacks = Vec::new();
    for (i, c) in configs.iter().enumerate() {
        let id = if c.id.is_empty() {
            format!("stage-{}", i)
        } else {
            c.id.clone()
        };
        let requires = stages.last().map(|s| vec![s.id.clone()]).unwrap_or_default();
        if c.name == stage::SCRIPT_RUN && has_on_rollback(&c.with) {
            rollbacks.push(PipelineStage {
                id: format!("{}{}", SCRIPT_RUN_ROLLBACK_PREFIX, id),
                name: stage::SCRIPT_RUN_ROLLBACK.to_string(),
                desc: format!("Rollback of {}", id),
                index: i as i32,
                visible: false,
                rollback: true,
                status: StageStatus::NotStartedYet,
                metadata: HashMap::from([(METADATA_BASE_STAGE_ID.to_string(), id.clone())]),
                created_at: now,
                updated_at: now,
                ..Default::default()
            });
        }
        stages.push(PipelineStage {
            id,
            name: c.name.clone(),
            desc: c.desc.clone(),
            index: i as i32,
            requires,
            visible: true,
            status: StageStatus::NotStartedYet,
            created_at: now,
            updated_at: now,
            ..Default::default()
        });
    }
    if auto_rollback {
        let index = stages.len() as i32;
        stages.push(rollback_stage(kind, Vec::new(), index, now));
    }
    stages.extend(rollbacks);
    stages
}

fn rollback_stage(kind: ApplicationKind, requires: Vec<String>, index: i32, now: i64) -> PipelineStage {
    PipelineStage {
        id: ROLLBACK_STAGE_ID.to_string(),
        name: rollback_stage_name(kind).to_string(),
        desc: "Rollback the deployment".to_string(),
        index,
        predefined: true,
        requires,
        visible: false,
        rollback: true,
        status: StageStatus::NotStartedYet,
        created_at: now,
        updated_at: now,
        ..Default::default()
    }
}

fn has_on_rollback(with: &serde_yaml::Value) -> bool {
    with.get("onRollback")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.trim().is_empty())
}

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

pub(crate) fn short_hash(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use keel_common::config::ApplicationConfig;

    use super::*;

    fn spec(yaml: &str) -> GenericApplicationSpec {
        ApplicationConfig::from_yaml(yaml).unwrap().spec
    }

    #[test]
    fn pipeline_stages_are_chained_and_followed_by_rollbacks() {
        let cfg = spec(
            r#"
apiVersion: keel.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
      - id: migrate
        name: SCRIPT_RUN
        with:
          run: ./migrate.sh
          onRollback: ./migrate.sh --down
      - name: K8S_PRIMARY_ROLLOUT
"#,
        );
        let stages = pipeline_stages(ApplicationKind::Kubernetes, &cfg, true, 10);
        let ids: Vec<&str> = stages.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["stage-0", "migrate", "stage-2", "rollback", "script-run-rollback-migrate"]
        );
        assert_eq!(stages[2].requires, vec!["migrate".to_string()]);
        assert!(stages[0].requires.is_empty());
        assert_eq!(stages[3].name, stage::K8S_ROLLBACK);
        assert!(stages[3].rollback && !stages[3].visible);
        assert_eq!(stages[4].index, 1);
        assert_eq!(
            stages[4].metadata.get(METADATA_BASE_STAGE_ID).map(String::as_str),
            Some("migrate")
        );
    }

    #[test]
    fn quick_sync_without_rollback() {
        let stages = quick_sync_stages(ApplicationKind::Terraform, false, 0);
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, stage::TERRAFORM_SYNC);
        assert!(stages[0].predefined);
    }
}
