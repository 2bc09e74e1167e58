//! The control-plane side of every call a piped makes.
//!
//! Handlers are stateless apart from the ownership caches, which map entity
//! ids to their owning piped or project. Losing those caches is harmless: a
//! miss or a mismatch falls back to the datastore and re-warms the entry.
use std::{sync::Arc, time::Duration};

use keel_common::{
    cache::TtlCache,
    model::{
        ChainApplicationRef, ChainBlock, ChainDeploymentRef, ChainNode, ChainStatus,
        ChainSyncApplicationCommand, Command, CommandStatus, CommandType, Deployment,
        DeploymentChain, DeploymentStatus, PipedStat, SyncStrategy,
    },
    rpc::*,
    time::now_unix,
};
use keel_database::{
    deployment_store::{PlannedUpdate, StageStatusUpdate},
    event_store::EventQuery,
    piped_store::PipedMeta,
    KeelDatabaseError, Stores,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const OWNERSHIP_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const OWNERSHIP_CACHE_EVICT_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);
pub const STAT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// The authenticated identity of the piped making a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub project_id: String,
    pub piped_id: String,
}

pub struct PipedApi {
    stores: Stores,
    web_base_url: String,
    app_piped_cache: TtlCache<String, String>,
    deployment_piped_cache: TtlCache<String, String>,
    env_project_cache: TtlCache<String, String>,
    stat_cache: TtlCache<String, PipedStat>,
}

/// Maps a store failure to its wire error, logging the ones the piped cannot act on.
fn db_err(op: &str, err: KeelDatabaseError) -> RpcError {
    let rpc: RpcError = err.into();
    if rpc.code == ApiCode::Internal {
        error!("failed to {}: {}", op, rpc.message);
    }
    rpc
}

impl PipedApi {
    pub fn new(stores: Stores, web_base_url: impl Into<String>) -> Self {
        Self {
            stores,
            web_base_url: web_base_url.into(),
            app_piped_cache: TtlCache::new(OWNERSHIP_CACHE_TTL, OWNERSHIP_CACHE_EVICT_INTERVAL),
            deployment_piped_cache: TtlCache::new(
                OWNERSHIP_CACHE_TTL,
                OWNERSHIP_CACHE_EVICT_INTERVAL,
            ),
            env_project_cache: TtlCache::new(OWNERSHIP_CACHE_TTL, OWNERSHIP_CACHE_EVICT_INTERVAL),
            stat_cache: TtlCache::new(STAT_CACHE_TTL, STAT_CACHE_TTL),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Latest stat reported by the piped, if it is still fresh.
    pub fn piped_stat(&self, piped_id: &str) -> Option<PipedStat> {
        self.stat_cache.get(&piped_id.to_string())
    }

    /// Periodically drops expired cache entries until `token` is cancelled.
    pub async fn run_cache_eviction(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(OWNERSHIP_CACHE_EVICT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = self.app_piped_cache.evict_expired()
                        + self.deployment_piped_cache.evict_expired()
                        + self.env_project_cache.evict_expired()
                        + self.stat_cache.evict_expired();
                    debug!(evicted, "evicted expired ownership cache entries");
                }
            }
        }
    }

    pub async fn authenticate(&self, token: &PipedToken) -> RpcResult<Caller> {
        let piped = match self.stores.pipeds.get(&token.piped_id).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                return Err(RpcError::unauthenticated(format!(
                    "piped {} was not found",
                    token.piped_id
                )))
            }
            Err(e) => return Err(db_err("get piped", e)),
        };
        if piped.project_id != token.project_id {
            return Err(RpcError::unauthenticated(
                "the piped does not belong to the project",
            ));
        }
        if piped.disabled {
            return Err(RpcError::unauthenticated("the piped is disabled"));
        }
        if !piped.check_key(&token.piped_key) {
            return Err(RpcError::unauthenticated("invalid piped key"));
        }
        Ok(Caller {
            project_id: piped.project_id,
            piped_id: piped.id,
        })
    }

    async fn validate_app_belongs_to_piped(&self, app_id: &str, caller: &Caller) -> RpcResult<()> {
        if self.app_piped_cache.get(&app_id.to_string()).as_deref() == Some(caller.piped_id.as_str()) {
            return Ok(());
        }
        let app = self
            .stores
            .applications
            .get(app_id)
            .await
            .map_err(|e| db_err("get application", e))?;
        self.app_piped_cache
            .put(app_id.to_string(), app.piped_id.clone());
        if app.piped_id != caller.piped_id {
            return Err(RpcError::permission_denied(format!(
                "requested application {} does not belong to your piped",
                app_id
            )));
        }
        Ok(())
    }

    async fn validate_deployment_belongs_to_piped(
        &self,
        deployment_id: &str,
        caller: &Caller,
    ) -> RpcResult<()> {
        if self
            .deployment_piped_cache
            .get(&deployment_id.to_string())
            .as_deref()
            == Some(caller.piped_id.as_str())
        {
            return Ok(());
        }
        let d = self
            .stores
            .deployments
            .get(deployment_id)
            .await
            .map_err(|e| db_err("get deployment", e))?;
        self.deployment_piped_cache
            .put(deployment_id.to_string(), d.piped_id.clone());
        if d.piped_id != caller.piped_id {
            return Err(RpcError::permission_denied(format!(
                "requested deployment {} does not belong to your piped",
                deployment_id
            )));
        }
        Ok(())
    }

    async fn validate_env_belongs_to_project(&self, env_id: &str, caller: &Caller) -> RpcResult<()> {
        if self.env_project_cache.get(&env_id.to_string()).as_deref() == Some(caller.project_id.as_str()) {
            return Ok(());
        }
        let env = self
            .stores
            .environments
            .get(env_id)
            .await
            .map_err(|e| db_err("get environment", e))?;
        self.env_project_cache
            .put(env_id.to_string(), env.project_id.clone());
        if env.project_id != caller.project_id {
            return Err(RpcError::permission_denied(format!(
                "requested environment {} does not belong to your project",
                env_id
            )));
        }
        Ok(())
    }

    /// Mirrors a deployment status onto its node in the deployment chain.
    async fn sync_chain_node(&self, d: &Deployment) {
        if !d.is_in_chain() {
            return;
        }
        let reference = ChainDeploymentRef {
            deployment_id: d.id.clone(),
            status: d.status,
            status_reason: d.status_reason.clone(),
        };
        if let Err(e) = self
            .stores
            .chains
            .update_node(
                &d.deployment_chain_id,
                d.deployment_chain_block_index,
                &d.application_id,
                reference,
            )
            .await
        {
            warn!(
                deployment_id = %d.id,
                chain_id = %d.deployment_chain_id,
                "unable to update deployment chain node: {}", e
            );
        }
    }

    pub async fn ping(&self, caller: &Caller, req: PingRequest) -> RpcResult<Empty> {
        debug!(piped_id = %caller.piped_id, version = %req.piped_version, "received ping");
        Ok(Empty {})
    }

    pub async fn report_stat(&self, caller: &Caller, req: ReportStatRequest) -> RpcResult<Empty> {
        self.stat_cache.put(
            caller.piped_id.clone(),
            PipedStat {
                piped_id: caller.piped_id.clone(),
                metrics: req.piped_stats,
                timestamp: now_unix(),
            },
        );
        Ok(Empty {})
    }

    pub async fn report_piped_meta(
        &self,
        caller: &Caller,
        req: ReportPipedMetaRequest,
    ) -> RpcResult<ReportPipedMetaResponse> {
        let meta = PipedMeta {
            version: req.version,
            platform_providers: req.platform_providers,
            repositories: req.repositories,
            secret_encryption: req.secret_encryption,
        };
        let piped = match self.stores.pipeds.update_meta(&caller.piped_id, meta).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                return Err(RpcError::invalid_argument(format!(
                    "piped {} is not registered",
                    caller.piped_id
                )))
            }
            Err(e) => return Err(db_err("update piped metadata", e)),
        };
        info!(piped_id = %piped.id, version = %piped.version, "piped is online");
        Ok(ReportPipedMetaResponse {
            name: piped.name,
            web_base_url: self.web_base_url.clone(),
        })
    }

    pub async fn get_environment(
        &self,
        caller: &Caller,
        req: GetEnvironmentRequest,
    ) -> RpcResult<GetEnvironmentResponse> {
        self.validate_env_belongs_to_project(&req.id, caller).await?;
        let environment = self
            .stores
            .environments
            .get(&req.id)
            .await
            .map_err(|e| db_err("get environment", e))?;
        Ok(GetEnvironmentResponse { environment })
    }

    pub async fn list_applications(&self, caller: &Caller) -> RpcResult<ListApplicationsResponse> {
        let applications = self
            .stores
            .applications
            .list_enabled_by_piped(&caller.piped_id)
            .await
            .map_err(|e| db_err("list applications", e))?;
        for app in &applications {
            self.app_piped_cache
                .put(app.id.clone(), app.piped_id.clone());
        }
        Ok(ListApplicationsResponse { applications })
    }

    pub async fn report_application_sync_state(
        &self,
        caller: &Caller,
        req: ReportApplicationSyncStateRequest,
    ) -> RpcResult<Empty> {
        self.validate_app_belongs_to_piped(&req.application_id, caller)
            .await?;
        self.stores
            .applications
            .update_sync_state(&req.application_id, req.state)
            .await
            .map_err(|e| db_err("update application sync state", e))?;
        Ok(Empty {})
    }

    pub async fn report_application_deploying_status(
        &self,
        caller: &Caller,
        req: ReportApplicationDeployingStatusRequest,
    ) -> RpcResult<Empty> {
        self.validate_app_belongs_to_piped(&req.application_id, caller)
            .await?;
        self.stores
            .applications
            .update_deploying_status(&req.application_id, req.deploying)
            .await
            .map_err(|e| db_err("update application deploying status", e))?;
        Ok(Empty {})
    }

    pub async fn report_application_most_recent_deployment(
        &self,
        caller: &Caller,
        req: ReportApplicationMostRecentDeploymentRequest,
    ) -> RpcResult<Empty> {
        self.validate_app_belongs_to_piped(&req.application_id, caller)
            .await?;
        self.stores
            .applications
            .update_most_recent_deployment(&req.application_id, req.status, req.deployment)
            .await
            .map_err(|e| db_err("update application most recent deployment", e))?;
        Ok(Empty {})
    }

    pub async fn get_application_most_recent_deployment(
        &self,
        caller: &Caller,
        req: GetApplicationMostRecentDeploymentRequest,
    ) -> RpcResult<GetApplicationMostRecentDeploymentResponse> {
        self.validate_app_belongs_to_piped(&req.application_id, caller)
            .await?;
        let app = self
            .stores
            .applications
            .get(&req.application_id)
            .await
            .map_err(|e| db_err("get application", e))?;
        let reference = if req.status == DeploymentStatus::Success {
            app.most_recently_successful_deployment
        } else {
            app.most_recently_triggered_deployment
        };
        reference
            .map(|deployment| GetApplicationMostRecentDeploymentResponse { deployment })
            .ok_or_else(|| RpcError::not_found("deployment was not found"))
    }

    pub async fn update_application_configurations(
        &self,
        caller: &Caller,
        req: UpdateApplicationConfigurationsRequest,
    ) -> RpcResult<Empty> {
        for info in req.applications {
            self.validate_app_belongs_to_piped(&info.id, caller).await?;
            self.stores
                .applications
                .update_configuration(&info.id, &info.name, &info.labels, &info.description)
                .await
                .map_err(|e| db_err("update application configuration", e))?;
        }
        Ok(Empty {})
    }

    pub async fn list_not_completed_deployments(
        &self,
        caller: &Caller,
    ) -> RpcResult<ListNotCompletedDeploymentsResponse> {
        let deployments = self
            .stores
            .deployments
            .list_not_completed_by_piped(&caller.piped_id)
            .await
            .map_err(|e| db_err("list not completed deployments", e))?;
        for d in &deployments {
            self.deployment_piped_cache
                .put(d.id.clone(), d.piped_id.clone());
        }
        Ok(ListNotCompletedDeploymentsResponse { deployments })
    }

    pub async fn get_deployment(
        &self,
        caller: &Caller,
        req: GetDeploymentRequest,
    ) -> RpcResult<GetDeploymentResponse> {
        self.validate_deployment_belongs_to_piped(&req.id, caller)
            .await?;
        let deployment = self
            .stores
            .deployments
            .get(&req.id)
            .await
            .map_err(|e| db_err("get deployment", e))?;
        Ok(GetDeploymentResponse { deployment })
    }

    pub async fn create_deployment(
        &self,
        caller: &Caller,
        req: CreateDeploymentRequest,
    ) -> RpcResult<Empty> {
        let d = req.deployment;
        if d.piped_id != caller.piped_id || d.project_id != caller.project_id {
            return Err(RpcError::permission_denied(
                "requested deployment does not belong to your piped",
            ));
        }
        self.validate_app_belongs_to_piped(&d.application_id, caller)
            .await?;
        self.stores
            .deployments
            .create(&d)
            .await
            .map_err(|e| db_err("create deployment", e))?;
        self.deployment_piped_cache
            .put(d.id.clone(), d.piped_id.clone());
        self.sync_chain_node(&d).await;
        info!(deployment_id = %d.id, application_id = %d.application_id, "deployment created");
        Ok(Empty {})
    }

    pub async fn report_deployment_planned(
        &self,
        caller: &Caller,
        req: ReportDeploymentPlannedRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        let planned = PlannedUpdate {
            summary: req.summary,
            status_reason: req.status_reason,
            running_commit_hash: req.running_commit_hash,
            running_config_filename: req.running_config_filename,
            version: req.version,
            stages: req.stages,
        };
        let d = self
            .stores
            .deployments
            .update_to_planned(&req.deployment_id, planned)
            .await
            .map_err(|e| db_err("update deployment to planned", e))?;
        self.sync_chain_node(&d).await;
        Ok(Empty {})
    }

    pub async fn report_deployment_status_changed(
        &self,
        caller: &Caller,
        req: ReportDeploymentStatusChangedRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        let d = self
            .stores
            .deployments
            .update_status(&req.deployment_id, req.status, &req.status_reason)
            .await
            .map_err(|e| db_err("update deployment status", e))?;
        self.sync_chain_node(&d).await;
        Ok(Empty {})
    }

    pub async fn report_deployment_completed(
        &self,
        caller: &Caller,
        req: ReportDeploymentCompletedRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        let d = self
            .stores
            .deployments
            .update_to_completed(
                &req.deployment_id,
                req.status,
                &req.status_reason,
                &req.stage_statuses,
                req.completed_at,
            )
            .await
            .map_err(|e| db_err("update deployment to completed", e))?;
        self.sync_chain_node(&d).await;
        info!(deployment_id = %d.id, status = %d.status, "deployment completed");
        Ok(Empty {})
    }

    pub async fn save_deployment_metadata(
        &self,
        caller: &Caller,
        req: SaveDeploymentMetadataRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        self.stores
            .deployments
            .merge_metadata(&req.deployment_id, &req.metadata)
            .await
            .map_err(|e| db_err("save deployment metadata", e))?;
        Ok(Empty {})
    }

    pub async fn save_stage_metadata(
        &self,
        caller: &Caller,
        req: SaveStageMetadataRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        self.stores
            .deployments
            .merge_stage_metadata(&req.deployment_id, &req.stage_id, &req.metadata)
            .await
            .map_err(|e| db_err("save stage metadata", e))?;
        Ok(Empty {})
    }

    pub async fn report_stage_logs(
        &self,
        caller: &Caller,
        req: ReportStageLogsRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        self.stores
            .stage_logs
            .append(&req.deployment_id, &req.stage_id, req.retried_count, &req.blocks)
            .await
            .map_err(|e| db_err("append stage logs", e))?;
        Ok(Empty {})
    }

    pub async fn report_stage_logs_from_last_checkpoint(
        &self,
        caller: &Caller,
        req: ReportStageLogsFromLastCheckpointRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        self.stores
            .stage_logs
            .put_from_checkpoint(
                &req.deployment_id,
                &req.stage_id,
                req.retried_count,
                &req.blocks,
                req.completed,
            )
            .await
            .map_err(|e| db_err("store stage logs", e))?;
        Ok(Empty {})
    }

    pub async fn report_stage_status_changed(
        &self,
        caller: &Caller,
        req: ReportStageStatusChangedRequest,
    ) -> RpcResult<Empty> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        let update = StageStatusUpdate {
            stage_id: req.stage_id,
            status: req.status,
            status_reason: req.status_reason,
            requires: req.requires,
            visible: req.visible,
            retried_count: req.retried_count,
            completed_at: req.completed_at,
        };
        self.stores
            .deployments
            .update_stage_status(&req.deployment_id, update)
            .await
            .map_err(|e| db_err("update stage status", e))?;
        Ok(Empty {})
    }

    pub async fn list_unhandled_commands(
        &self,
        caller: &Caller,
    ) -> RpcResult<ListUnhandledCommandsResponse> {
        let commands = self
            .stores
            .commands
            .list_unhandled(&caller.piped_id)
            .await
            .map_err(|e| db_err("list unhandled commands", e))?;
        Ok(ListUnhandledCommandsResponse { commands })
    }

    pub async fn report_command_handled(
        &self,
        caller: &Caller,
        req: ReportCommandHandledRequest,
    ) -> RpcResult<Empty> {
        let cmd = self
            .stores
            .commands
            .get(&req.command_id)
            .await
            .map_err(|e| db_err("get command", e))?;
        if cmd.piped_id != caller.piped_id {
            return Err(RpcError::permission_denied(format!(
                "requested command {} does not belong to your piped",
                req.command_id
            )));
        }
        self.stores
            .commands
            .update_handled(
                &req.command_id,
                req.status,
                &req.metadata,
                req.handled_at,
                req.output.as_deref(),
            )
            .await
            .map_err(|e| db_err("update command", e))?;
        Ok(Empty {})
    }

    pub async fn report_application_live_state(
        &self,
        caller: &Caller,
        req: ReportApplicationLiveStateRequest,
    ) -> RpcResult<Empty> {
        let mut snapshot = req.snapshot;
        self.validate_app_belongs_to_piped(&snapshot.application_id, caller)
            .await?;
        snapshot.piped_id = caller.piped_id.clone();
        snapshot.project_id = caller.project_id.clone();
        self.stores
            .live_states
            .put_snapshot(&snapshot)
            .await
            .map_err(|e| db_err("store application live state", e))?;
        Ok(Empty {})
    }

    pub async fn report_application_live_state_events(
        &self,
        caller: &Caller,
        req: ReportApplicationLiveStateEventsRequest,
    ) -> RpcResult<ReportApplicationLiveStateEventsResponse> {
        let mut failed_ids = Vec::new();
        let mut accepted = Vec::with_capacity(req.events.len());
        for event in req.events {
            match self
                .validate_app_belongs_to_piped(&event.application_id, caller)
                .await
            {
                Ok(()) => accepted.push(event),
                Err(e) => {
                    warn!(event_id = %event.id, "dropping live state event: {}", e);
                    failed_ids.push(event.id);
                }
            }
        }
        failed_ids.extend(self.stores.live_states.apply_events(&accepted).await);
        Ok(ReportApplicationLiveStateEventsResponse { failed_ids })
    }

    pub async fn get_latest_event(
        &self,
        caller: &Caller,
        req: GetLatestEventRequest,
    ) -> RpcResult<GetLatestEventResponse> {
        let event = self
            .stores
            .events
            .get_latest(&caller.project_id, &req.name, &req.labels)
            .await
            .map_err(|e| db_err("get latest event", e))?;
        Ok(GetLatestEventResponse { event })
    }

    pub async fn list_events(
        &self,
        caller: &Caller,
        req: ListEventsRequest,
    ) -> RpcResult<ListEventsResponse> {
        if req.to > 0 && req.to <= req.from {
            return Err(RpcError::invalid_argument(
                "the upper bound of the time range must be greater than the lower bound",
            ));
        }
        let query = EventQuery {
            from: req.from,
            to: req.to,
            descending: req.order == ListOrder::Desc,
            status: req.status,
            limit: 0,
        };
        let events = self
            .stores
            .events
            .list(&caller.project_id, &query)
            .await
            .map_err(|e| db_err("list events", e))?;
        Ok(ListEventsResponse { events })
    }

    pub async fn report_event_statuses(
        &self,
        caller: &Caller,
        req: ReportEventStatusesRequest,
    ) -> RpcResult<Empty> {
        for report in req.events {
            let event = self
                .stores
                .events
                .get(&report.id)
                .await
                .map_err(|e| db_err("get event", e))?;
            if event.project_id != caller.project_id {
                return Err(RpcError::permission_denied(format!(
                    "requested event {} does not belong to your project",
                    report.id
                )));
            }
            self.stores
                .events
                .update_status(&report.id, report.status, &report.status_description)
                .await
                .map_err(|e| db_err("update event status", e))?;
        }
        Ok(Empty {})
    }

    pub async fn get_latest_analysis_result(
        &self,
        caller: &Caller,
        req: GetLatestAnalysisResultRequest,
    ) -> RpcResult<GetLatestAnalysisResultResponse> {
        self.validate_app_belongs_to_piped(&req.application_id, caller)
            .await?;
        let analysis_result = self
            .stores
            .analysis_results
            .get_latest(&req.application_id)
            .await
            .map_err(|e| db_err("get analysis result", e))?;
        Ok(GetLatestAnalysisResultResponse { analysis_result })
    }

    pub async fn put_latest_analysis_result(
        &self,
        caller: &Caller,
        req: PutLatestAnalysisResultRequest,
    ) -> RpcResult<Empty> {
        self.validate_app_belongs_to_piped(&req.application_id, caller)
            .await?;
        self.stores
            .analysis_results
            .put_latest(&req.application_id, &req.analysis_result)
            .await
            .map_err(|e| db_err("put analysis result", e))?;
        Ok(Empty {})
    }

    pub async fn get_desired_version(&self, caller: &Caller) -> RpcResult<GetDesiredVersionResponse> {
        let piped = self
            .stores
            .pipeds
            .get(&caller.piped_id)
            .await
            .map_err(|e| db_err("get piped", e))?;
        let version = if piped.desired_version.is_empty() {
            piped.version
        } else {
            piped.desired_version
        };
        Ok(GetDesiredVersionResponse { version })
    }

    /// Creates a chain whose first block holds the given deployment and whose
    /// following blocks hold the applications selected by each matcher. Every
    /// application of a following block receives a chain sync command.
    pub async fn create_deployment_chain(
        &self,
        caller: &Caller,
        req: CreateDeploymentChainRequest,
    ) -> RpcResult<CreateDeploymentChainResponse> {
        let mut first = req.first_deployment;
        if first.piped_id != caller.piped_id || first.project_id != caller.project_id {
            return Err(RpcError::permission_denied(
                "requested deployment does not belong to your piped",
            ));
        }
        self.validate_app_belongs_to_piped(&first.application_id, caller)
            .await?;

        let apps = self
            .stores
            .applications
            .list(&keel_database::datastore::ListOptions::new()
                .eq("project_id", caller.project_id.as_str())
                .eq("disabled", false))
            .await
            .map_err(|e| db_err("list applications", e))?;

        let chain_id = uuid::Uuid::new_v4().to_string();
        let mut blocks = vec![ChainBlock {
            nodes: vec![ChainNode {
                application_ref: ChainApplicationRef {
                    application_id: first.application_id.clone(),
                    application_name: first.application_name.clone(),
                    application_kind: first.kind,
                },
                deployment_ref: None,
            }],
            status: ChainStatus::Pending,
        }];
        for matcher in req.matchers.iter().filter(|m| !m.is_empty()) {
            let nodes: Vec<ChainNode> = apps
                .iter()
                .filter(|a| a.id != first.application_id && matcher.matches(a))
                .map(|a| ChainNode {
                    application_ref: ChainApplicationRef {
                        application_id: a.id.clone(),
                        application_name: a.name.clone(),
                        application_kind: a.kind,
                    },
                    deployment_ref: None,
                })
                .collect();
            if nodes.is_empty() {
                warn!(chain_id = %chain_id, matcher = ?matcher, "no application matched the chain matcher");
                continue;
            }
            blocks.push(ChainBlock {
                nodes,
                status: ChainStatus::Pending,
            });
        }

        let chain = DeploymentChain {
            id: chain_id.clone(),
            project_id: caller.project_id.clone(),
            status: ChainStatus::Pending,
            blocks,
            created_at: 0,
            updated_at: 0,
        };
        let chain = self
            .stores
            .chains
            .create(&chain)
            .await
            .map_err(|e| db_err("create deployment chain", e))?;

        first.deployment_chain_id = chain_id.clone();
        first.deployment_chain_block_index = 0;
        self.stores
            .deployments
            .create(&first)
            .await
            .map_err(|e| db_err("create deployment", e))?;
        self.deployment_piped_cache
            .put(first.id.clone(), first.piped_id.clone());
        self.sync_chain_node(&first).await;

        for (index, block) in chain.blocks.iter().enumerate().skip(1) {
            for node in &block.nodes {
                let Some(app) = apps
                    .iter()
                    .find(|a| a.id == node.application_ref.application_id)
                else {
                    continue;
                };
                let command = Command {
                    id: uuid::Uuid::new_v4().to_string(),
                    piped_id: app.piped_id.clone(),
                    project_id: app.project_id.clone(),
                    application_id: app.id.clone(),
                    deployment_id: String::new(),
                    stage_id: String::new(),
                    r#type: CommandType::ChainSyncApplication,
                    commander: chain_id.clone(),
                    handled: false,
                    status: CommandStatus::NotHandledYet,
                    metadata: Default::default(),
                    output_blob_key: String::new(),
                    handled_at: 0,
                    sync_application: None,
                    chain_sync_application: Some(ChainSyncApplicationCommand {
                        deployment_chain_id: chain_id.clone(),
                        block_index: index as u32,
                        application_id: app.id.clone(),
                        sync_strategy: SyncStrategy::Auto,
                    }),
                    created_at: 0,
                    updated_at: 0,
                };
                self.stores
                    .commands
                    .create(&command)
                    .await
                    .map_err(|e| db_err("create chain sync command", e))?;
            }
        }
        info!(chain_id = %chain_id, blocks = chain.blocks.len(), "deployment chain created");
        Ok(CreateDeploymentChainResponse {
            deployment_chain_id: chain_id,
        })
    }

    pub async fn in_chain_deployment_plannable(
        &self,
        caller: &Caller,
        req: InChainDeploymentPlannableRequest,
    ) -> RpcResult<InChainDeploymentPlannableResponse> {
        self.validate_deployment_belongs_to_piped(&req.deployment_id, caller)
            .await?;
        let chain = self
            .stores
            .chains
            .get(&req.deployment_chain_id)
            .await
            .map_err(|e| db_err("get deployment chain", e))?;
        let index = req.deployment_chain_block_index as usize;
        let block = chain.blocks.get(index).ok_or_else(|| {
            RpcError::invalid_argument(format!(
                "block {} does not exist in deployment chain {}",
                index, chain.id
            ))
        })?;

        let cancel = |reason: String| InChainDeploymentPlannableResponse {
            plannable: false,
            cancel: true,
            cancel_reason: reason,
        };
        if block.is_completed() {
            return Ok(cancel(format!(
                "Block which contains this deployment is finished with {} status",
                block.status
            )));
        }
        if index == 0 {
            return Ok(InChainDeploymentPlannableResponse {
                plannable: true,
                ..Default::default()
            });
        }
        let previous = &chain.blocks[index - 1];
        match previous.status {
            ChainStatus::Success => Ok(InChainDeploymentPlannableResponse {
                plannable: true,
                ..Default::default()
            }),
            ChainStatus::Failure | ChainStatus::Cancelled => Ok(cancel(format!(
                "Previous block finished with {} status",
                previous.status
            ))),
            ChainStatus::Pending | ChainStatus::Running => {
                Ok(InChainDeploymentPlannableResponse::default())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::HashMap, sync::Arc};

    use keel_common::model::{Application, ApplicationKind, Deployment, Environment, Piped};
    use keel_database::{LocalFileStore, MemoryDataStore, Stores};

    use super::*;

    pub const PROJECT: &str = "proj";
    pub const KEY: &str = "piped-key";

    pub struct Fixture {
        pub api: Arc<PipedApi>,
        pub ds: Arc<MemoryDataStore>,
        pub _dir: tempfile::TempDir,
    }

    pub fn caller(piped: &str) -> Caller {
        Caller {
            project_id: PROJECT.to_string(),
            piped_id: piped.to_string(),
        }
    }

    pub fn app(id: &str, piped: &str) -> Application {
        Application {
            id: id.to_string(),
            name: id.to_string(),
            project_id: PROJECT.to_string(),
            piped_id: piped.to_string(),
            kind: ApplicationKind::Kubernetes,
            labels: HashMap::from([("env".to_string(), "dev".to_string())]),
            ..Default::default()
        }
    }

    pub fn deployment(id: &str, app_id: &str, piped: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            application_id: app_id.to_string(),
            application_name: app_id.to_string(),
            piped_id: piped.to_string(),
            project_id: PROJECT.to_string(),
            status: DeploymentStatus::Pending,
            ..Default::default()
        }
    }

    /// Two pipeds of the same project, each owning one application.
    pub async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ds = Arc::new(MemoryDataStore::new());
        let stores = Stores::new(ds.clone(), Arc::new(LocalFileStore::new(dir.path())));
        for piped in ["p1", "p2"] {
            stores
                .pipeds
                .create(&Piped {
                    id: piped.to_string(),
                    name: format!("{}-name", piped),
                    project_id: PROJECT.to_string(),
                    key_hash: Piped::hash_key(KEY),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        stores.applications.create(&app("a1", "p1")).await.unwrap();
        stores.applications.create(&app("a2", "p2")).await.unwrap();
        stores
            .environments
            .create(&Environment {
                id: "env".to_string(),
                name: "dev".to_string(),
                project_id: PROJECT.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        Fixture {
            api: Arc::new(PipedApi::new(stores, "https://keel.example.com")),
            ds,
            _dir: dir,
        }
    }
}
