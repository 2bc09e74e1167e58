use async_trait::async_trait;

use super::{messages::*, RpcResult};

/// Every call a piped can make against the control plane.
///
/// The caller identity is not part of the requests: the HTTP client attaches
/// the piped token to each call and the server resolves it before dispatching.
#[async_trait]
pub trait PipedService: Send + Sync {
    async fn ping(&self, req: PingRequest) -> RpcResult<Empty>;
    async fn report_stat(&self, req: ReportStatRequest) -> RpcResult<Empty>;
    async fn report_piped_meta(&self, req: ReportPipedMetaRequest)
        -> RpcResult<ReportPipedMetaResponse>;
    async fn get_environment(&self, req: GetEnvironmentRequest)
        -> RpcResult<GetEnvironmentResponse>;

    async fn list_applications(&self) -> RpcResult<ListApplicationsResponse>;
    async fn report_application_sync_state(
        &self,
        req: ReportApplicationSyncStateRequest,
    ) -> RpcResult<Empty>;
    async fn report_application_deploying_status(
        &self,
        req: ReportApplicationDeployingStatusRequest,
    ) -> RpcResult<Empty>;
    async fn report_application_most_recent_deployment(
        &self,
        req: ReportApplicationMostRecentDeploymentRequest,
    ) -> RpcResult<Empty>;
    async fn get_application_most_recent_deployment(
        &self,
        req: GetApplicationMostRecentDeploymentRequest,
    ) -> RpcResult<GetApplicationMostRecentDeploymentResponse>;
    async fn update_application_configurations(
        &self,
        req: UpdateApplicationConfigurationsRequest,
    ) -> RpcResult<Empty>;

    async fn list_not_completed_deployments(&self)
        -> RpcResult<ListNotCompletedDeploymentsResponse>;
    async fn get_deployment(&self, req: GetDeploymentRequest) -> RpcResult<GetDeploymentResponse>;
    async fn create_deployment(&self, req: CreateDeploymentRequest) -> RpcResult<Empty>;
    async fn report_deployment_planned(&self, req: ReportDeploymentPlannedRequest)
        -> RpcResult<Empty>;
    async fn report_deployment_status_changed(
        &self,
        req: ReportDeploymentStatusChangedRequest,
    ) -> RpcResult<Empty>;
    async fn report_deployment_completed(
        &self,
        req: ReportDeploymentCompletedRequest,
    ) -> RpcResult<Empty>;
    async fn save_deployment_metadata(&self, req: SaveDeploymentMetadataRequest)
        -> RpcResult<Empty>;
    async fn save_stage_metadata(&self, req: SaveStageMetadataRequest) -> RpcResult<Empty>;
    async fn report_stage_logs(&self, req: ReportStageLogsRequest) -> RpcResult<Empty>;
    async fn report_stage_logs_from_last_checkpoint(
        &self,
        req: ReportStageLogsFromLastCheckpointRequest,
    ) -> RpcResult<Empty>;
    async fn report_stage_status_changed(
        &self,
        req: ReportStageStatusChangedRequest,
    ) -> RpcResult<Empty>;

    async fn list_unhandled_commands(&self) -> RpcResult<ListUnhandledCommandsResponse>;
    async fn report_command_handled(&self, req: ReportCommandHandledRequest) -> RpcResult<Empty>;

    async fn report_application_live_state(
        &self,
        req: ReportApplicationLiveStateRequest,
    ) -> RpcResult<Empty>;
    async fn report_application_live_state_events(
        &self,
        req: ReportApplicationLiveStateEventsRequest,
    ) -> RpcResult<ReportApplicationLiveStateEventsResponse>;

    async fn get_latest_event(&self, req: GetLatestEventRequest)
        -> RpcResult<GetLatestEventResponse>;
    async fn list_events(&self, req: ListEventsRequest) -> RpcResult<ListEventsResponse>;
    async fn report_event_statuses(&self, req: ReportEventStatusesRequest) -> RpcResult<Empty>;

    async fn get_latest_analysis_result(
        &self,
        req: GetLatestAnalysisResultRequest,
    ) -> RpcResult<GetLatestAnalysisResultResponse>;
    async fn put_latest_analysis_result(
        &self,
        req: PutLatestAnalysisResultRequest,
    ) -> RpcResult<Empty>;

    async fn get_desired_version(&self) -> RpcResult<GetDesiredVersionResponse>;

    async fn create_deployment_chain(
        &self,
        req: CreateDeploymentChainRequest,
    ) -> RpcResult<CreateDeploymentChainResponse>;
    async fn in_chain_deployment_plannable(
        &self,
        req: InChainDeploymentPlannableRequest,
    ) -> RpcResult<InChainDeploymentPlannableResponse>;
}
