use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{
    AnalysisResult, Application, ApplicationDeploymentReference, ApplicationKind,
    ApplicationLiveStateSnapshot, ApplicationSyncState, Command, CommandStatus, Deployment,
    DeploymentStatus, Environment, Event, EventStatus, LogBlock, PipedPlatformProvider,
    PipedRepository, PipedSecretEncryption, PipelineStage, ResourceStateEvent, StageStatus,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub piped_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStatRequest {
    /// Prometheus text exposition of the agent's metrics.
    pub piped_stats: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportPipedMetaRequest {
    pub version: String,
    #[serde(default)]
    pub platform_providers: Vec<PipedPlatformProvider>,
    #[serde(default)]
    pub repositories: Vec<PipedRepository>,
    #[serde(default)]
    pub secret_encryption: Option<PipedSecretEncryption>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportPipedMetaResponse {
    pub name: String,
    pub web_base_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetEnvironmentRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEnvironmentResponse {
    pub environment: Environment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListApplicationsResponse {
    pub applications: Vec<Application>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportApplicationSyncStateRequest {
    pub application_id: String,
    pub state: ApplicationSyncState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportApplicationDeployingStatusRequest {
    pub application_id: String,
    pub deploying: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportApplicationMostRecentDeploymentRequest {
    pub application_id: String,
    pub status: DeploymentStatus,
    pub deployment: ApplicationDeploymentReference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetApplicationMostRecentDeploymentRequest {
    pub application_id: String,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetApplicationMostRecentDeploymentResponse {
    pub deployment: ApplicationDeploymentReference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateApplicationConfigurationsRequest {
    pub applications: Vec<ApplicationInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListNotCompletedDeploymentsResponse {
    pub deployments: Vec<Deployment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDeploymentRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDeploymentResponse {
    pub deployment: Deployment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub deployment: Deployment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportDeploymentPlannedRequest {
    pub deployment_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub running_commit_hash: String,
    #[serde(default)]
    pub running_config_filename: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportDeploymentStatusChangedRequest {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportDeploymentCompletedRequest {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub stage_statuses: HashMap<String, StageStatus>,
    pub completed_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveDeploymentMetadataRequest {
    pub deployment_id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveStageMetadataRequest {
    pub deployment_id: String,
    pub stage_id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStageLogsRequest {
    pub deployment_id: String,
    pub stage_id: String,
    #[serde(default)]
    pub retried_count: u32,
    pub blocks: Vec<LogBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStageLogsFromLastCheckpointRequest {
    pub deployment_id: String,
    pub stage_id: String,
    #[serde(default)]
    pub retried_count: u32,
    pub blocks: Vec<LogBlock>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStageStatusChangedRequest {
    pub deployment_id: String,
    pub stage_id: String,
    pub status: StageStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub retried_count: u32,
    #[serde(default)]
    pub completed_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListUnhandledCommandsResponse {
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportCommandHandledRequest {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub handled_at: i64,
    /// Optional output persisted next to the command.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportApplicationLiveStateRequest {
    pub snapshot: ApplicationLiveStateSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportApplicationLiveStateEventsRequest {
    pub events: Vec<ResourceStateEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportApplicationLiveStateEventsResponse {
    /// Ids of the events that could not be applied.
    #[serde(default)]
    pub failed_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLatestEventRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLatestEventResponse {
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListEventsRequest {
    /// Inclusive lower bound on `created_at`.
    #[serde(default)]
    pub from: i64,
    /// Exclusive upper bound on `created_at`; zero means unbounded.
    #[serde(default)]
    pub to: i64,
    #[serde(default)]
    pub order: ListOrder,
    #[serde(default)]
    pub status: Option<EventStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListEventsResponse {
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStatusReport {
    pub id: String,
    pub status: EventStatus,
    #[serde(default)]
    pub status_description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportEventStatusesRequest {
    pub events: Vec<EventStatusReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLatestAnalysisResultRequest {
    pub application_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLatestAnalysisResultResponse {
    pub analysis_result: AnalysisResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutLatestAnalysisResultRequest {
    pub application_id: String,
    pub analysis_result: AnalysisResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDesiredVersionResponse {
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainApplicationMatcher {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: Option<ApplicationKind>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ChainApplicationMatcher {
    pub fn matches(&self, app: &Application) -> bool {
        (self.name.is_empty() || self.name == app.name)
            && self.kind.map_or(true, |k| k == app.kind)
            && self.labels.iter().all(|(k, v)| app.labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.kind.is_none() && self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentChainRequest {
    pub first_deployment: Deployment,
    pub matchers: Vec<ChainApplicationMatcher>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateDeploymentChainResponse {
    pub deployment_chain_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InChainDeploymentPlannableRequest {
    pub deployment_id: String,
    pub deployment_chain_id: String,
    pub deployment_chain_block_index: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InChainDeploymentPlannableResponse {
    pub plannable: bool,
    pub cancel: bool,
    #[serde(default)]
    pub cancel_reason: String,
}
