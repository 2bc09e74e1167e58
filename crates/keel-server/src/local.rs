//! An in-process [`PipedService`] backed directly by a [`PipedApi`].
//!
//! Every call is authenticated with the client's token exactly as the HTTP
//! route does, so agents wired to it see the same errors as remote ones.
use std::sync::Arc;

use async_trait::async_trait;
use keel_common::rpc::*;

use crate::piped_api::{Caller, PipedApi};

#[derive(Clone)]
pub struct LocalClient {
    api: Arc<PipedApi>,
    token: PipedToken,
}

impl LocalClient {
    pub fn new(api: Arc<PipedApi>, token: PipedToken) -> Self {
        Self { api, token }
    }

    async fn caller(&self) -> RpcResult<Caller> {
        self.api.authenticate(&self.token).await
    }
}

#[async_trait]
impl PipedService for LocalClient {
    async fn ping(&self, req: PingRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.ping(&caller, req).await
    }

    async fn report_stat(&self, req: ReportStatRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_stat(&caller, req).await
    }

    async fn report_piped_meta(&self, req: ReportPipedMetaRequest) -> RpcResult<ReportPipedMetaResponse> {
        let caller = self.caller().await?;
        self.api.report_piped_meta(&caller, req).await
    }

    async fn get_environment(&self, req: GetEnvironmentRequest) -> RpcResult<GetEnvironmentResponse> {
        let caller = self.caller().await?;
        self.api.get_environment(&caller, req).await
    }

    async fn list_applications(&self) -> RpcResult<ListApplicationsResponse> {
        let caller = self.caller().await?;
        self.api.list_applications(&caller).await
    }

    async fn report_application_sync_state(&self, req: ReportApplicationSyncStateRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_application_sync_state(&caller, req).await
    }

    async fn report_application_deploying_status(&self, req: ReportApplicationDeployingStatusRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_application_deploying_status(&caller, req).await
    }

    async fn report_application_most_recent_deployment(&self, req: ReportApplicationMostRecentDeploymentRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_application_most_recent_deployment(&caller, req).await
    }

    async fn get_application_most_recent_deployment(&self, req: GetApplicationMostRecentDeploymentRequest) -> RpcResult<GetApplicationMostRecentDeploymentResponse> {
        let caller = self.caller().await?;
        self.api.get_application_most_recent_deployment(&caller, req).await
    }

    async fn update_application_configurations(&self, req: UpdateApplicationConfigurationsRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.update_application_configurations(&caller, req).await
    }

    async fn list_not_completed_deployments(&self) -> RpcResult<ListNotCompletedDeploymentsResponse> {
        let caller = self.caller().await?;
        self.api.list_not_completed_deployments(&caller).await
    }

    async fn get_deployment(&self, req: GetDeploymentRequest) -> RpcResult<GetDeploymentResponse> {
        let caller = self.caller().await?;
        self.api.get_deployment(&caller, req).await
    }

    async fn create_deployment(&self, req: CreateDeploymentRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.create_deployment(&caller, req).await
    }

    async fn report_deployment_planned(&self, req: ReportDeploymentPlannedRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_deployment_planned(&caller, req).await
    }

    async fn report_deployment_status_changed(&self, req: ReportDeploymentStatusChangedRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_deployment_status_changed(&caller, req).await
    }

    async fn report_deployment_completed(&self, req: ReportDeploymentCompletedRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_deployment_completed(&caller, req).await
    }

    async fn save_deployment_metadata(&self, req: SaveDeploymentMetadataRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.save_deployment_metadata(&caller, req).await
    }

    async fn save_stage_metadata(&self, req: SaveStageMetadataRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.save_stage_metadata(&caller, req).await
    }

    async fn report_stage_logs(&self, req: ReportStageLogsRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_stage_logs(&caller, req).await
    }

    async fn report_stage_logs_from_last_checkpoint(&self, req: ReportStageLogsFromLastCheckpointRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_stage_logs_from_last_checkpoint(&caller, req).await
    }

    async fn report_stage_status_changed(&self, req: ReportStageStatusChangedRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_stage_status_changed(&caller, req).await
    }

    async fn list_unhandled_commands(&self) -> RpcResult<ListUnhandledCommandsResponse> {
        let caller = self.caller().await?;
        self.api.list_unhandled_commands(&caller).await
    }

    async fn report_command_handled(&self, req: ReportCommandHandledRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_command_handled(&caller, req).await
    }

    async fn report_application_live_state(&self, req: ReportApplicationLiveStateRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_application_live_state(&caller, req).await
    }

    async fn report_application_live_state_events(&self, req: ReportApplicationLiveStateEventsRequest) -> RpcResult<ReportApplicationLiveStateEventsResponse> {
        let caller = self.caller().await?;
        self.api.report_application_live_state_events(&caller, req).await
    }

    async fn get_latest_event(&self, req: GetLatestEventRequest) -> RpcResult<GetLatestEventResponse> {
        let caller = self.caller().await?;
        self.api.get_latest_event(&caller, req).await
    }

    async fn list_events(&self, req: ListEventsRequest) -> RpcResult<ListEventsResponse> {
        let caller = self.caller().await?;
        self.api.list_events(&caller, req).await
    }

    async fn report_event_statuses(&self, req: ReportEventStatusesRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.report_event_statuses(&caller, req).await
    }

    async fn get_latest_analysis_result(&self, req: GetLatestAnalysisResultRequest) -> RpcResult<GetLatestAnalysisResultResponse> {
        let caller = self.caller().await?;
        self.api.get_latest_analysis_result(&caller, req).await
    }

    async fn put_latest_analysis_result(&self, req: PutLatestAnalysisResultRequest) -> RpcResult<Empty> {
        let caller = self.caller().await?;
        self.api.put_latest_analysis_result(&caller, req).await
    }

    async fn get_desired_version(&self) -> RpcResult<GetDesiredVersionResponse> {
        let caller = self.caller().await?;
        self.api.get_desired_version(&caller).await
    }

    async fn create_deployment_chain(&self, req: CreateDeploymentChainRequest) -> RpcResult<CreateDeploymentChainResponse> {
        let caller = self.caller().await?;
        self.api.create_deployment_chain(&caller, req).await
    }

    async fn in_chain_deployment_plannable(&self, req: InChainDeploymentPlannableRequest) -> RpcResult<InChainDeploymentPlannableResponse> {
        let caller = self.caller().await?;
        self.api.in_chain_deployment_plannable(&caller, req).await
    }
}
