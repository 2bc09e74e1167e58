use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use super::application::{ApplicationGitPath, ApplicationKind};

/// Metadata key holding the JSON-encoded notification mentions of a deployment.
pub const METADATA_DEPLOYMENT_NOTIFICATION: &str = "DeploymentNotification";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Planned,
    Running,
    RollingBack,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    pub const NOT_COMPLETED: [DeploymentStatus; 4] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Planned,
        DeploymentStatus::Running,
        DeploymentStatus::RollingBack,
    ];

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::Pending => 0,
            DeploymentStatus::Planned => 1,
            DeploymentStatus::Running => 2,
            DeploymentStatus::RollingBack => 3,
            _ => 4,
        }
    }

    /// Whether moving from `self` to `next` respects the deployment lifecycle.
    ///
    /// Non-completed statuses only move one step forward
    /// (`PENDING -> PLANNED -> RUNNING -> ROLLING_BACK`) while any non-completed
    /// status may end in a completed one. Staying on the same status is allowed
    /// so that replayed reports are harmless.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_completed() {
            return false;
        }
        if next.is_completed() {
            return true;
        }
        next.rank() == self.rank() + 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "DEPLOYMENT_PENDING",
            DeploymentStatus::Planned => "DEPLOYMENT_PLANNED",
            DeploymentStatus::Running => "DEPLOYMENT_RUNNING",
            DeploymentStatus::RollingBack => "DEPLOYMENT_ROLLING_BACK",
            DeploymentStatus::Success => "DEPLOYMENT_SUCCESS",
            DeploymentStatus::Failure => "DEPLOYMENT_FAILURE",
            DeploymentStatus::Cancelled => "DEPLOYMENT_CANCELLED",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    #[default]
    Auto,
    QuickSync,
    PipelineSync,
}

/// Why the piped decided to create a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    OnCommit,
    OnCommand,
    OnOutOfSync,
    OnChain,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::OnCommit => "ON_COMMIT",
            TriggerKind::OnCommand => "ON_COMMAND",
            TriggerKind::OnOutOfSync => "ON_OUT_OF_SYNC",
            TriggerKind::OnChain => "ON_CHAIN",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTrigger {
    pub commit: Commit,
    #[serde(default)]
    pub commander: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sync_strategy: SyncStrategy,
    #[serde(default)]
    pub strategy_summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    #[default]
    NotStartedYet,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
    Exited,
}

impl StageStatus {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            StageStatus::Success
                | StageStatus::Failure
                | StageStatus::Cancelled
                | StageStatus::Skipped
                | StageStatus::Exited
        )
    }

    /// Statuses that unblock the stages requiring this one.
    pub fn satisfies_requirement(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::NotStartedYet => "STAGE_NOT_STARTED_YET",
            StageStatus::Running => "STAGE_RUNNING",
            StageStatus::Success => "STAGE_SUCCESS",
            StageStatus::Failure => "STAGE_FAILURE",
            StageStatus::Cancelled => "STAGE_CANCELLED",
            StageStatus::Skipped => "STAGE_SKIPPED",
            StageStatus::Exited => "STAGE_EXITED",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub predefined: bool,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub retried_count: u32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub completed_at: i64,
}

fn default_visible() -> bool {
    true
}

impl PipelineStage {
    /// Rollback stages are excluded from the forward pass of a pipeline.
    pub fn is_rollback(&self) -> bool {
        self.rollback || self.name.ends_with("ROLLBACK")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    #[serde(default)]
    pub application_name: String,
    pub piped_id: String,
    pub project_id: String,
    #[serde(default)]
    pub env_id: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,
    #[serde(default)]
    pub platform_provider: String,
    pub trigger: DeploymentTrigger,
    #[serde(default)]
    pub running_commit_hash: String,
    #[serde(default)]
    pub running_config_filename: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub summary: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub deployment_chain_id: String,
    #[serde(default)]
    pub deployment_chain_block_index: u32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub completed_at: i64,
}

impl Deployment {
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn stage(&self, id: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut PipelineStage> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    pub fn is_in_chain(&self) -> bool {
        !self.deployment_chain_id.is_empty()
    }

    /// Checks that every stage `requires` entry references a known stage and
    /// that the requirements do not form a cycle.
    pub fn validate_stage_dag(&self) -> Result<(), String> {
        let index: HashMap<&str, &PipelineStage> =
            self.stages.iter().map(|s| (s.id.as_str(), s)).collect();
        for stage in &self.stages {
            for req in &stage.requires {
                if !index.contains_key(req.as_str()) {
                    return Err(format!(
                        "stage {} requires an unknown stage {}",
                        stage.id, req
                    ));
                }
            }
        }

        // 0: unvisited, 1: visiting, 2: done
        let mut marks: HashMap<&str, u8> = HashMap::new();
        fn visit<'a>(
            id: &'a str,
            index: &HashMap<&'a str, &'a PipelineStage>,
            marks: &mut HashMap<&'a str, u8>,
        ) -> Result<(), String> {
            match marks.get(id) {
                Some(2) => return Ok(()),
                Some(1) => return Err(format!("stage requirements form a cycle at {}", id)),
                _ => {}
            }
            marks.insert(id, 1);
            if let Some(stage) = index.get(id) {
                for req in &stage.requires {
                    visit(req.as_str(), index, marks)?;
                }
            }
            marks.insert(id, 2);
            Ok(())
        }
        for stage in &self.stages {
            visit(stage.id.as_str(), &index, &mut marks)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    #[default]
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBlock {
    pub index: i64,
    pub log: String,
    pub severity: LogSeverity,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DeploymentStatus; 7] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Planned,
        DeploymentStatus::Running,
        DeploymentStatus::RollingBack,
        DeploymentStatus::Success,
        DeploymentStatus::Failure,
        DeploymentStatus::Cancelled,
    ];

    fn allowed(from: DeploymentStatus, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        if from == to {
            return true;
        }
        matches!(
            (from, to),
            (Pending, Planned)
                | (Planned, Running)
                | (Running, RollingBack)
                | (Pending | Planned | Running | RollingBack, Success | Failure | Cancelled)
        )
    }

    #[test]
    fn status_transitions_are_monotonic() {
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed(from, to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn completed_statuses_never_move() {
        for from in ALL.into_iter().filter(|s| s.is_completed()) {
            for to in ALL.into_iter().filter(|to| *to != from) {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    fn stage(id: &str, requires: &[&str]) -> PipelineStage {
        PipelineStage {
            id: id.to_string(),
            name: id.to_uppercase(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            visible: true,
            ..Default::default()
        }
    }

    #[test]
    fn detects_stage_cycles() {
        let mut d = Deployment {
            stages: vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["b"])],
            ..Default::default()
        };
        assert!(d.validate_stage_dag().is_ok());

        d.stages[0].requires = vec!["c".to_string()];
        assert!(d.validate_stage_dag().is_err());

        d.stages[0].requires = vec!["missing".to_string()];
        assert!(d.validate_stage_dag().is_err());
    }

    #[test]
    fn rollback_stage_detection() {
        let mut s = stage("r", &[]);
        s.name = "K8S_ROLLBACK".to_string();
        assert!(s.is_rollback());
        let mut s = stage("r", &[]);
        s.rollback = true;
        assert!(s.is_rollback());
        assert!(!stage("x", &[]).is_rollback());
    }
}
