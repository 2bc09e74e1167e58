use std::{collections::HashMap, sync::Arc};

use keel_common::{
    model::{Deployment, DeploymentStatus, PipelineStage, StageStatus},
    time::now_unix,
};
use serde_json::json;

use super::Collection;
use crate::{
    datastore::{DataStore, Direction, Filter, Kind, ListOptions, Operator},
    error::{KeelDatabaseError, KeelDatabaseResult},
};

/// Fields written when a deployment leaves PENDING.
#[derive(Debug, Clone, Default)]
pub struct PlannedUpdate {
    pub summary: String,
    pub status_reason: String,
    pub running_commit_hash: String,
    pub running_config_filename: String,
    pub version: String,
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, Default)]
pub struct StageStatusUpdate {
    pub stage_id: String,
    pub status: StageStatus,
    pub status_reason: String,
    pub requires: Vec<String>,
    pub visible: bool,
    pub retried_count: u32,
    pub completed_at: i64,
}

#[derive(Clone)]
pub struct DeploymentStore {
    collection: Collection<Deployment>,
}

fn transition(d: &mut Deployment, next: DeploymentStatus, reason: &str) -> KeelDatabaseResult<bool> {
    if d.status == next {
        return Ok(false);
    }
    if !d.status.can_transition_to(next) {
        return Err(KeelDatabaseError::InvalidArgument(format!(
            "invalid deployment status transition from {} to {}",
            d.status, next
        )));
    }
    let now = now_unix();
    d.status = next;
    d.status_reason = reason.to_string();
    if next.is_completed() && d.completed_at == 0 {
        d.completed_at = now;
    }
    d.updated_at = now;
    Ok(true)
}

fn stage_mut<'a>(d: &'a mut Deployment, stage_id: &str) -> KeelDatabaseResult<&'a mut PipelineStage> {
    let deployment_id = d.id.clone();
    d.stage_mut(stage_id).ok_or_else(|| {
        KeelDatabaseError::InvalidArgument(format!(
            "stage {} was not found in deployment {}",
            stage_id, deployment_id
        ))
    })
}

impl DeploymentStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            collection: Collection::new(ds, Kind::Deployment),
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<Deployment> {
        self.collection.get(id).await
    }

    pub async fn create(&self, deployment: &Deployment) -> KeelDatabaseResult {
        if deployment.id.is_empty() || deployment.application_id.is_empty() {
            return Err(KeelDatabaseError::InvalidArgument(
                "deployment id and application id are required".into(),
            ));
        }
        if deployment.status.is_completed() {
            return Err(KeelDatabaseError::InvalidArgument(format!(
                "deployment cannot be created with a completed status {}",
                deployment.status
            )));
        }
        deployment
            .validate_stage_dag()
            .map_err(KeelDatabaseError::InvalidArgument)?;
        let mut d = deployment.clone();
        let now = now_unix();
        if d.created_at == 0 {
            d.created_at = now;
        }
        d.updated_at = now;
        self.collection.create(&d.id, &d).await
    }

    pub async fn list(&self, opts: &ListOptions) -> KeelDatabaseResult<Vec<Deployment>> {
        self.collection.list(opts).await
    }

    /// Non-completed deployments of a piped, oldest first.
    pub async fn list_not_completed_by_piped(
        &self,
        piped_id: &str,
    ) -> KeelDatabaseResult<Vec<Deployment>> {
        let statuses: Vec<_> = DeploymentStatus::NOT_COMPLETED
            .iter()
            .map(|s| json!(s))
            .collect();
        let opts = ListOptions::new()
            .eq("piped_id", piped_id)
            .filter(Filter::new("status", Operator::In, statuses))
            .order("created_at", Direction::Asc);
        self.collection.list(&opts).await
    }

    pub async fn update_to_planned(
        &self,
        id: &str,
        planned: PlannedUpdate,
    ) -> KeelDatabaseResult<Deployment> {
        self.collection
            .update(id, |d| {
                if d.status == DeploymentStatus::Planned {
                    return Ok(false);
                }
                let mut next = d.clone();
                next.stages = planned.stages.clone();
                next.validate_stage_dag()
                    .map_err(KeelDatabaseError::InvalidArgument)?;
                transition(&mut next, DeploymentStatus::Planned, &planned.status_reason)?;
                next.summary = planned.summary.clone();
                next.running_commit_hash = planned.running_commit_hash.clone();
                next.running_config_filename = planned.running_config_filename.clone();
                next.version = planned.version.clone();
                *d = next;
                Ok(true)
            })
            .await
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> KeelDatabaseResult<Deployment> {
        self.collection
            .update(id, |d| transition(d, status, reason))
            .await
    }

    /// Moves the deployment to a completed status and applies the final
    /// stage statuses. Replaying the same completion is a no-op.
    pub async fn update_to_completed(
        &self,
        id: &str,
        status: DeploymentStatus,
        reason: &str,
        stage_statuses: &HashMap<String, StageStatus>,
        completed_at: i64,
    ) -> KeelDatabaseResult<Deployment> {
        if !status.is_completed() {
            return Err(KeelDatabaseError::InvalidArgument(format!(
                "deployment status {} is not a completed status",
                status
            )));
        }
        self.collection
            .update(id, |d| {
                if !transition(d, status, reason)? {
                    return Ok(false);
                }
                if completed_at > 0 {
                    d.completed_at = completed_at;
                }
                for stage in d.stages.iter_mut() {
                    if let Some(s) = stage_statuses.get(&stage.id) {
                        stage.status = *s;
                    }
                }
                Ok(true)
            })
            .await
    }

    pub async fn merge_metadata(
        &self,
        id: &str,
        metadata: &HashMap<String, String>,
    ) -> KeelDatabaseResult<Deployment> {
        self.collection
            .update(id, |d| {
                let changed = metadata.iter().any(|(k, v)| d.metadata.get(k) != Some(v));
                if changed {
                    d.metadata
                        .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                    d.updated_at = now_unix();
                }
                Ok(changed)
            })
            .await
    }

    pub async fn merge_stage_metadata(
        &self,
        id: &str,
        stage_id: &str,
        metadata: &HashMap<String, String>,
    ) -> KeelDatabaseResult<Deployment> {
        self.collection
            .update(id, |d| {
                let stage = stage_mut(d, stage_id)?;
                let changed = metadata
                    .iter()
                    .any(|(k, v)| stage.metadata.get(k) != Some(v));
                if changed {
                    stage
                        .metadata
                        .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                    stage.updated_at = now_unix();
                    d.updated_at = now_unix();
                }
                Ok(changed)
            })
            .await
    }

    pub async fn update_stage_status(
        &self,
        id: &str,
        update: StageStatusUpdate,
    ) -> KeelDatabaseResult<Deployment> {
        self.collection
            .update(id, |d| {
                let completed = d.is_completed();
                let statuses: HashMap<String, StageStatus> =
                    d.stages.iter().map(|s| (s.id.clone(), s.status)).collect();
                let stage = stage_mut(d, &update.stage_id)?;

                let unchanged = stage.status == update.status
                    && stage.status_reason == update.status_reason
                    && stage.retried_count == update.retried_count
                    && stage.visible == update.visible
                    && (update.requires.is_empty() || stage.requires == update.requires);
                if unchanged {
                    return Ok(false);
                }
                if completed {
                    return Err(KeelDatabaseError::InvalidArgument(format!(
                        "stage {} of completed deployment {} cannot be changed",
                        update.stage_id, id
                    )));
                }

                let requires = if update.requires.is_empty() {
                    stage.requires.clone()
                } else {
                    update.requires.clone()
                };
                for req in &requires {
                    let Some(status) = statuses.get(req) else {
                        return Err(KeelDatabaseError::InvalidArgument(format!(
                            "stage {} requires an unknown stage {}",
                            update.stage_id, req
                        )));
                    };
                    if update.status == StageStatus::Running
                        && !stage.is_rollback()
                        && !status.satisfies_requirement()
                    {
                        return Err(KeelDatabaseError::InvalidArgument(format!(
                            "stage {} cannot run before its required stage {} succeeded",
                            update.stage_id, req
                        )));
                    }
                }

                let now = now_unix();
                stage.status = update.status;
                stage.status_reason = update.status_reason.clone();
                stage.requires = requires;
                stage.visible = update.visible;
                stage.retried_count = update.retried_count;
                stage.completed_at = update.completed_at;
                stage.updated_at = now;
                d.updated_at = now;
                d.validate_stage_dag()
                    .map_err(KeelDatabaseError::InvalidArgument)?;
                Ok(true)
            })
            .await
    }
}
