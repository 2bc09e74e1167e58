use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use super::deployment::{Deployment, DeploymentStatus, DeploymentTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationKind {
    #[default]
    Kubernetes,
    Terraform,
    Cloudrun,
    Lambda,
    Ecs,
    Crossplane,
}

impl ApplicationKind {
    pub const ALL: [ApplicationKind; 6] = [
        ApplicationKind::Kubernetes,
        ApplicationKind::Terraform,
        ApplicationKind::Cloudrun,
        ApplicationKind::Lambda,
        ApplicationKind::Ecs,
        ApplicationKind::Crossplane,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationKind::Kubernetes => "KUBERNETES",
            ApplicationKind::Terraform => "TERRAFORM",
            ApplicationKind::Cloudrun => "CLOUDRUN",
            ApplicationKind::Lambda => "LAMBDA",
            ApplicationKind::Ecs => "ECS",
            ApplicationKind::Crossplane => "CROSSPLANE",
        }
    }

    /// The `kind` value used in the application configuration file.
    pub fn config_kind(&self) -> &'static str {
        match self {
            ApplicationKind::Kubernetes => "KubernetesApp",
            ApplicationKind::Terraform => "TerraformApp",
            ApplicationKind::Cloudrun => "CloudRunApp",
            ApplicationKind::Lambda => "LambdaApp",
            ApplicationKind::Ecs => "ECSApp",
            ApplicationKind::Crossplane => "CrossplaneApp",
        }
    }

    pub fn from_config_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.config_kind() == kind)
    }
}

impl fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationGitRepository {
    pub id: String,
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub branch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationGitPath {
    pub repo: ApplicationGitRepository,
    /// Directory of the application relative to the repository root.
    pub path: String,
    #[serde(default)]
    pub config_filename: String,
    #[serde(default)]
    pub url: String,
}

pub const DEFAULT_APPLICATION_CONFIG_FILENAME: &str = "app.keel.yaml";

impl ApplicationGitPath {
    pub fn config_filename(&self) -> &str {
        if self.config_filename.is_empty() {
            DEFAULT_APPLICATION_CONFIG_FILENAME
        } else {
            &self.config_filename
        }
    }

    /// Path of the application configuration file relative to the repository root.
    pub fn config_path(&self) -> String {
        let dir = self.path.trim_end_matches('/');
        if dir.is_empty() || dir == "." {
            self.config_filename().to_string()
        } else {
            format!("{}/{}", dir, self.config_filename())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationSyncStatus {
    #[default]
    Unknown,
    Synced,
    OutOfSync,
    Deploying,
    InvalidConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSyncState {
    pub status: ApplicationSyncStatus,
    #[serde(default)]
    pub short_reason: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub head_deployment_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl ApplicationSyncState {
    /// Two states are considered equal when they carry the same information,
    /// regardless of when they were observed.
    pub fn has_changed(&self, next: &ApplicationSyncState) -> bool {
        self.status != next.status
            || self.short_reason != next.short_reason
            || self.reason != next.reason
            || self.head_deployment_id != next.head_deployment_id
    }
}

/// Light-weight reference to a deployment kept on the application record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDeploymentReference {
    pub deployment_id: String,
    pub trigger: DeploymentTrigger,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: i64,
}

impl From<&Deployment> for ApplicationDeploymentReference {
    fn from(d: &Deployment) -> Self {
        Self {
            deployment_id: d.id.clone(),
            trigger: d.trigger.clone(),
            summary: d.summary.clone(),
            version: d.version.clone(),
            started_at: d.created_at,
            completed_at: d.completed_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub piped_id: String,
    #[serde(default)]
    pub env_id: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,
    #[serde(default)]
    pub platform_provider: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub deploying: bool,
    #[serde(default)]
    pub sync_state: ApplicationSyncState,
    #[serde(default)]
    pub most_recently_triggered_deployment: Option<ApplicationDeploymentReference>,
    #[serde(default)]
    pub most_recently_successful_deployment: Option<ApplicationDeploymentReference>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Application {
    /// Whether the given deployment status means this application is still deploying.
    pub fn is_deploying_status(status: DeploymentStatus) -> bool {
        !status.is_completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_joins_directory_and_filename() {
        let p = ApplicationGitPath {
            path: "apps/demo/".to_string(),
            ..Default::default()
        };
        assert_eq!(p.config_path(), "apps/demo/app.keel.yaml");

        let p = ApplicationGitPath {
            path: ".".to_string(),
            config_filename: "custom.yaml".to_string(),
            ..Default::default()
        };
        assert_eq!(p.config_path(), "custom.yaml");
    }

    #[test]
    fn kind_round_trips_config_kind() {
        for kind in ApplicationKind::ALL {
            assert_eq!(ApplicationKind::from_config_kind(kind.config_kind()), Some(kind));
        }
        assert_eq!(ApplicationKind::from_config_kind("Unknown"), None);
    }

    #[test]
    fn sync_state_change_ignores_timestamp() {
        let a = ApplicationSyncState {
            status: ApplicationSyncStatus::Synced,
            timestamp: 1,
            ..Default::default()
        };
        let b = ApplicationSyncState {
            timestamp: 2,
            ..a.clone()
        };
        assert!(!a.has_changed(&b));
        let c = ApplicationSyncState {
            status: ApplicationSyncStatus::OutOfSync,
            ..a.clone()
        };
        assert!(a.has_changed(&c));
    }
}
