use std::{collections::HashMap, sync::Arc};

use keel_common::{
    model::{Application, ApplicationDeploymentReference, ApplicationSyncState, DeploymentStatus},
    time::now_unix,
};

use super::Collection;
use crate::{
    datastore::{DataStore, Kind, ListOptions},
    error::{KeelDatabaseError, KeelDatabaseResult},
};

#[derive(Clone)]
pub struct ApplicationStore {
    collection: Collection<Application>,
}

impl ApplicationStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            collection: Collection::new(ds, Kind::Application),
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<Application> {
        self.collection.get(id).await
    }

    pub async fn create(&self, app: &Application) -> KeelDatabaseResult {
        if app.id.is_empty() || app.piped_id.is_empty() || app.project_id.is_empty() {
            return Err(KeelDatabaseError::InvalidArgument(
                "application id, piped id and project id are required".into(),
            ));
        }
        let mut app = app.clone();
        let now = now_unix();
        if app.created_at == 0 {
            app.created_at = now;
        }
        app.updated_at = now;
        self.collection.create(&app.id, &app).await
    }

    pub async fn list(&self, opts: &ListOptions) -> KeelDatabaseResult<Vec<Application>> {
        self.collection.list(opts).await
    }

    /// Enabled applications managed by the given piped.
    pub async fn list_enabled_by_piped(&self, piped_id: &str) -> KeelDatabaseResult<Vec<Application>> {
        let opts = ListOptions::new()
            .eq("piped_id", piped_id)
            .eq("disabled", false);
        self.collection.list(&opts).await
    }

    pub async fn update_sync_state(
        &self,
        id: &str,
        state: ApplicationSyncState,
    ) -> KeelDatabaseResult<Application> {
        self.collection
            .update(id, |app| {
                if !app.sync_state.has_changed(&state) {
                    return Ok(false);
                }
                app.sync_state = state.clone();
                app.updated_at = now_unix();
                Ok(true)
            })
            .await
    }

    pub async fn update_deploying_status(
        &self,
        id: &str,
        deploying: bool,
    ) -> KeelDatabaseResult<Application> {
        self.collection
            .update(id, |app| {
                if app.deploying == deploying {
                    return Ok(false);
                }
                app.deploying = deploying;
                app.updated_at = now_unix();
                Ok(true)
            })
            .await
    }

    /// Records `deployment` as the most recently successful one when `status`
    /// is SUCCESS and as the most recently triggered one otherwise.
    pub async fn update_most_recent_deployment(
        &self,
        id: &str,
        status: DeploymentStatus,
        deployment: ApplicationDeploymentReference,
    ) -> KeelDatabaseResult<Application> {
        if !matches!(status, DeploymentStatus::Success | DeploymentStatus::Pending) {
            return Err(KeelDatabaseError::InvalidArgument(format!(
                "most recent deployment can only be tracked for SUCCESS or PENDING, got {}",
                status
            )));
        }
        self.collection
            .update(id, |app| {
                let slot = if status == DeploymentStatus::Success {
                    &mut app.most_recently_successful_deployment
                } else {
                    &mut app.most_recently_triggered_deployment
                };
                if slot.as_ref() == Some(&deployment) {
                    return Ok(false);
                }
                *slot = Some(deployment.clone());
                app.updated_at = now_unix();
                Ok(true)
            })
            .await
    }

    pub async fn update_configuration(
        &self,
        id: &str,
        name: &str,
        labels: &HashMap<String, String>,
        description: &str,
    ) -> KeelDatabaseResult<Application> {
        self.collection
            .update(id, |app| {
                if app.name == name && app.labels == *labels && app.description == description {
                    return Ok(false);
                }
                app.name = name.to_string();
                app.labels = labels.clone();
                app.description = description.to_string();
                app.updated_at = now_unix();
                Ok(true)
            })
            .await
    }

    pub async fn set_disabled(&self, id: &str, disabled: bool) -> KeelDatabaseResult<Application> {
        self.collection
            .update(id, |app| {
                if app.disabled == disabled {
                    return Ok(false);
                }
                app.disabled = disabled;
                app.updated_at = now_unix();
                Ok(true)
            })
            .await
    }
}
