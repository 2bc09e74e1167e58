use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use keel_common::{
    config::{GenericApplicationSpec, PipelineStageConfig, SkipOptions},
    git::Client,
    model::{
        ApplicationDeploymentReference, Command, CommandStatus, Deployment,
        DeploymentStatus, PipelineStage, StageStatus,
    },
    rpc::{
        PipedService, ReportApplicationMostRecentDeploymentRequest,
        ReportDeploymentCompletedRequest, ReportDeploymentStatusChangedRequest,
        ReportStageStatusChangedRequest,
    },
    time::now_unix,
    util::path_matcher::PathMatcher,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::CommandStore,
    deploysource::{DeploySource, Provider},
    error::KeelPipedResult,
    executor::{self, new_stop_signal, ExecutorInput, StopSignalType},
    logpersister::Persister,
    metadatastore::MetadataStore,
    planner::METADATA_BASE_STAGE_ID,
};

/// Used when the application config has no timeout.
const DEFAULT_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
const LOG_COMPLETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a scheduler shares with its controller.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub client: Arc<dyn PipedService>,
    pub git: Arc<Client>,
    pub commands: Arc<CommandStore>,
    pub persister: Persister,
    pub executors: Arc<executor::Registry>,
    /// Names of the platform providers configured on this agent.
    pub providers: Arc<HashSet<String>>,
}

/// What happened to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageResult {
    Finished(StageStatus, Option<StopSignalType>),
    /// The agent is shutting down; nothing was reported.
    Terminated,
}

struct Run {
    target: Arc<DeploySource>,
    running: Option<Arc<DeploySource>>,
    app_config: GenericApplicationSpec,
    metadata: Arc<MetadataStore>,
    statuses: HashMap<String, StageStatus>,
}

/// Drives one planned deployment to a terminal status.
pub struct Scheduler {
    deployment: Deployment,
    work_dir: PathBuf,
    deps: SchedulerDeps,
    cancel_tx: watch::Sender<Option<Command>>,
    done: AtomicBool,
    done_status: Mutex<Option<DeploymentStatus>>,
}

impl Scheduler {
    pub fn new(deployment: Deployment, work_dir: PathBuf, deps: SchedulerDeps) -> Self {
        let (cancel_tx, _) = watch::channel(None);
        Self {
            deployment,
            work_dir,
            deps,
            cancel_tx,
            done: AtomicBool::new(false),
            done_status: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.deployment.id
    }

    pub fn application_id(&self) -> &str {
        &self.deployment.application_id
    }

    /// Delivers a cancel command. Only the first one is kept.
    pub fn cancel(&self, cmd: Command) {
        self.cancel_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cmd);
            true
        });
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn done_status(&self) -> Option<DeploymentStatus> {
        *self.done_status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_command(&self) -> Option<Command> {
        self.cancel_tx.borrow().clone()
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        let result = self.run_inner(&token).await;
        if let Err(e) = &result {
            error!(deployment_id = %self.deployment.id, "scheduler failed: {}", e);
        }
        self.done.store(true, Ordering::Release);
        result
    }

    async fn run_inner(&self, token: &CancellationToken) -> KeelPipedResult {
        let d = &self.deployment;
        info!(deployment_id = %d.id, application_id = %d.application_id, "start running deployment");

        if d.status == DeploymentStatus::Planned {
            self.report_status(
                DeploymentStatus::Running,
                "The piped started handling this deployment",
            )
            .await?;
            info!(deployment_id = %d.id, notification = "DEPLOYMENT_STARTED", "deployment started");
        }

        let git_path = d.git_path.clone();
        let target = Provider::new(
            &self.work_dir.join("target-deploysource"),
            self.deps.git.clone(),
            git_path.clone(),
            d.kind,
            &d.trigger.commit.hash,
        );
        let target = match target.get().await {
            Ok(t) => t,
            Err(e) => {
                let reason = format!("Failed to prepare the target deploy source ({})", e);
                self.complete(DeploymentStatus::Failure, &reason, &HashMap::new())
                    .await?;
                return Ok(());
            }
        };
        let running = if d.running_commit_hash.is_empty() {
            None
        } else {
            let provider = Provider::new(
                &self.work_dir.join("running-deploysource"),
                self.deps.git.clone(),
                git_path,
                d.kind,
                &d.running_commit_hash,
            );
            match provider.get().await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(deployment_id = %d.id, "unable to prepare the running deploy source: {}", e);
                    None
                }
            }
        };

        let mut run = Run {
            app_config: target.app_config.clone(),
            target,
            running,
            metadata: Arc::new(MetadataStore::new(self.deps.client.clone(), d)),
            statuses: d.stages.iter().map(|s| (s.id.clone(), s.status)).collect(),
        };

        let mut status = DeploymentStatus::Success;
        let mut reason = "Completed Successfully".to_string();
        let mut last_executed: Option<String> = None;

        for stage in &d.stages {
            if stage.is_rollback() || !stage.visible {
                continue;
            }
            match run.statuses.get(&stage.id).copied().unwrap_or_default() {
                StageStatus::Success | StageStatus::Skipped => {
                    last_executed = Some(stage.id.clone());
                    continue;
                }
                StageStatus::Cancelled => {
                    status = DeploymentStatus::Cancelled;
                    reason = format!("Stage {} was cancelled", stage.name);
                    last_executed = Some(stage.id.clone());
                    break;
                }
                StageStatus::Failure => {
                    status = DeploymentStatus::Failure;
                    reason = format!("Failed while executing stage {}", stage.name);
                    last_executed = Some(stage.id.clone());
                    break;
                }
                _ => {}
            }
            if let Some(req) = stage
                .requires
                .iter()
                .find(|r| !run.statuses.get(*r).is_some_and(|s| s.satisfies_requirement()))
            {
                status = DeploymentStatus::Failure;
                reason = format!(
                    "Stage {} requires {} which has not succeeded",
                    stage.name, req
                );
                break;
            }

            let result = self.execute_stage(&mut run, stage.clone(), token, true).await?;
            last_executed = Some(stage.id.clone());
            match result {
                StageResult::Terminated => return Ok(()),
                StageResult::Finished(StageStatus::Success | StageStatus::Skipped, _) => {}
                StageResult::Finished(StageStatus::Exited, _) => break,
                StageResult::Finished(StageStatus::Cancelled, _) => {
                    status = DeploymentStatus::Cancelled;
                    let commander = self
                        .cancel_command()
                        .map(|c| c.commander)
                        .unwrap_or_default();
                    reason = format!(
                        "Cancelled by {} while executing stage {}",
                        commander, stage.name
                    );
                    break;
                }
                StageResult::Finished(_, sig) => {
                    status = DeploymentStatus::Failure;
                    reason = if sig == Some(StopSignalType::Timeout) {
                        format!("Timed out while executing stage {}", stage.name)
                    } else {
                        format!("Failed while executing stage {}", stage.name)
                    };
                    break;
                }
            }
        }

        let rollbacks: Vec<PipelineStage> =
            d.stages.iter().filter(|s| s.is_rollback()).cloned().collect();
        if matches!(status, DeploymentStatus::Cancelled | DeploymentStatus::Failure)
            && !rollbacks.is_empty()
        {
            self.report_status(DeploymentStatus::RollingBack, "Rolling back the deployment")
                .await?;
            for mut rollback in rollbacks {
                if let Some(base) = rollback.metadata.get(METADATA_BASE_STAGE_ID) {
                    if run.statuses.get(base).copied().unwrap_or_default()
                        == StageStatus::NotStartedYet
                    {
                        continue;
                    }
                }
                if run.statuses.get(&rollback.id).copied().unwrap_or_default().is_completed() {
                    continue;
                }
                if let Some(last) = &last_executed {
                    rollback.requires = vec![last.clone()];
                }
                let id = rollback.id.clone();
                if self.execute_stage(&mut run, rollback, token, false).await? == StageResult::Terminated {
                    return Ok(());
                }
                last_executed = Some(id);
            }
        }

        if status == DeploymentStatus::Cancelled {
            if let Some(cmd) = self.cancel_command() {
                if let Err(e) = self
                    .deps
                    .commands
                    .report_command_handled(&cmd, CommandStatus::Succeeded, HashMap::new(), None)
                    .await
                {
                    warn!(command_id = %cmd.id, "failed to report cancel command: {}", e);
                }
            }
        }
        self.complete(status, &reason, &run.statuses).await?;
        if status == DeploymentStatus::Success {
            self.report_most_recent_success().await?;
        }
        Ok(())
    }

    async fn execute_stage(
        &self,
        run: &mut Run,
        mut stage: PipelineStage,
        token: &CancellationToken,
        cancellable: bool,
    ) -> KeelPipedResult<StageResult> {
        let d = &self.deployment;
        let original = run.statuses.get(&stage.id).copied().unwrap_or_default();
        let log = self
            .deps
            .persister
            .stage_log_persister(&d.id, &stage.id, stage.retried_count);

        self.report_stage(&stage, StageStatus::Running, "").await?;
        run.statuses.insert(stage.id.clone(), StageStatus::Running);
        info!(deployment_id = %d.id, stage_id = %stage.id, notification = "STAGE_STARTED", "stage started");

        let (status, signal, failure) = match self.prepare_stage(run, &stage).await {
            Err(reason) => {
                log.error(&reason);
                (StageStatus::Failure, None, Some(reason))
            }
            Ok(None) => {
                log.info("The stage was skipped");
                (StageStatus::Skipped, None, None)
            }
            Ok(Some((config, executor))) => {
                let timeout = config
                    .timeout
                    .filter(|t| !t.is_zero())
                    .unwrap_or(run.app_config.timeout);
                let timeout = if timeout.is_zero() {
                    DEFAULT_DEPLOYMENT_TIMEOUT
                } else {
                    timeout.as_std()
                };
                let mut deployment = d.clone();
                if let Some(s) = deployment.stage_mut(&stage.id) {
                    s.requires = stage.requires.clone();
                }
                let input = ExecutorInput {
                    deployment,
                    stage: stage.clone(),
                    stage_config: config,
                    app_config: run.app_config.clone(),
                    target_source: run.target.clone(),
                    running_source: run.running.clone(),
                    log: log.clone(),
                    metadata: run.metadata.clone(),
                    commands: self.deps.commands.clone(),
                };
                self.run_executor(executor, input, timeout, token, cancellable).await
            }
        };

        if signal == Some(StopSignalType::Terminate) {
            info!(deployment_id = %d.id, stage_id = %stage.id, "stage was terminated, keeping its previous status");
            self.report_stage(&stage, original, "").await?;
            return Ok(StageResult::Terminated);
        }

        let reason = match (signal, failure) {
            (Some(StopSignalType::Timeout), _) => "The stage timed out".to_string(),
            (Some(StopSignalType::Cancel), _) => "The stage was cancelled".to_string(),
            (_, Some(reason)) => reason,
            _ if status == StageStatus::Failure => "The stage executor reported a failure".to_string(),
            _ => String::new(),
        };
        run.statuses.insert(stage.id.clone(), status);
        stage.status = status;
        self.report_stage(&stage, status, &reason).await?;
        info!(
            deployment_id = %d.id,
            stage_id = %stage.id,
            status = status.as_str(),
            notification = stage_notification(status),
            "stage finished"
        );
        if let Err(e) = log.complete(LOG_COMPLETE_TIMEOUT).await {
            warn!(deployment_id = %d.id, stage_id = %stage.id, "failed to complete stage log: {}", e);
        }
        Ok(StageResult::Finished(status, signal))
    }

    /// Resolves the config and executor of a stage. `Ok(None)` means the
    /// stage is skipped.
    #[allow(clippy::type_complexity)]
    async fn prepare_stage(
        &self,
        run: &Run,
        stage: &PipelineStage,
    ) -> Result<Option<(PipelineStageConfig, Arc<dyn executor::Executor>)>, String> {
        let d = &self.deployment;
        if !self.deps.providers.contains(&d.platform_provider) {
            return Err(format!(
                "The platform provider {} is not configured on this piped",
                d.platform_provider
            ));
        }
        let config = if stage.predefined {
            PipelineStageConfig {
                id: stage.id.clone(),
                name: stage.name.clone(),
                desc: stage.desc.clone(),
                ..Default::default()
            }
        } else {
            run.app_config
                .stage(stage.index)
                .cloned()
                .ok_or_else(|| {
                    format!(
                        "Unable to find the config of stage {} at index {}",
                        stage.name, stage.index
                    )
                })?
        };
        if !stage.is_rollback() && self.should_skip(run, &config.skip_on).await? {
            return Ok(None);
        }
        let executor = self
            .deps
            .executors
            .executor(stage, d.kind)
            .ok_or_else(|| format!("No executor is registered for stage {}", stage.name))?;
        Ok(Some((config, executor)))
    }

    async fn should_skip(&self, run: &Run, opts: &SkipOptions) -> Result<bool, String> {
        if opts.is_empty() {
            return Ok(false);
        }
        let commit = &self.deployment.trigger.commit;
        let changed = if opts.paths.is_empty() || self.deployment.running_commit_hash.is_empty() {
            None
        } else {
            let files = run
                .target
                .repo
                .changed_files(&self.deployment.running_commit_hash, &commit.hash)
                .await
                .map_err(|e| format!("Unable to list changed files ({})", e))?;
            Some(files)
        };
        skip_by(opts, &commit.message, changed.as_deref())
    }

    async fn run_executor(
        &self,
        executor: Arc<dyn executor::Executor>,
        input: ExecutorInput,
        timeout: Duration,
        token: &CancellationToken,
        cancellable: bool,
    ) -> (StageStatus, Option<StopSignalType>, Option<String>) {
        let (sig, handler) = new_stop_signal();
        let log = input.log.clone();
        let mut handle = tokio::spawn(async move { executor.execute(&input, sig).await });
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        let mut cancel_rx = self.cancel_tx.subscribe();
        let cancelled = async move {
            loop {
                if cancel_rx.borrow_and_update().is_some() {
                    return;
                }
                if cancel_rx.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        };
        tokio::pin!(cancelled);

        let joined = loop {
            let stopped = handler.signal().is_some();
            tokio::select! {
                biased;
                _ = token.cancelled(), if !stopped => { handler.terminate(); }
                _ = &mut sleep, if !stopped => {
                    log.error(format!("The stage timed out after {:?}", timeout));
                    handler.timeout();
                }
                _ = &mut cancelled, if !stopped && cancellable => { handler.cancel(); }
                r = &mut handle => break r,
            }
        };
        match joined {
            Ok(s) => (s, handler.signal(), None),
            Err(e) => {
                let reason = format!("The stage executor stopped unexpectedly: {}", e);
                log.error(&reason);
                (StageStatus::Failure, handler.signal(), Some(reason))
            }
        }
    }

    async fn report_status(&self, status: DeploymentStatus, reason: &str) -> KeelPipedResult {
        let req = ReportDeploymentStatusChangedRequest {
            deployment_id: self.deployment.id.clone(),
            status,
            status_reason: reason.to_string(),
        };
        with_retry(&rpc_retry(), |_| {
            self.deps.client.report_deployment_status_changed(req.clone())
        })
        .await?;
        Ok(())
    }

    async fn report_stage(&self, stage: &PipelineStage, status: StageStatus, reason: &str) -> KeelPipedResult {
        let req = ReportStageStatusChangedRequest {
            deployment_id: self.deployment.id.clone(),
            stage_id: stage.id.clone(),
            status,
            status_reason: reason.to_string(),
            requires: stage.requires.clone(),
            visible: stage.visible,
            retried_count: stage.retried_count,
            completed_at: if status.is_completed() { now_unix() } else { 0 },
        };
        with_retry(&rpc_retry(), |_| {
            self.deps.client.report_stage_status_changed(req.clone())
        })
        .await?;
        Ok(())
    }

    async fn complete(
        &self,
        status: DeploymentStatus,
        reason: &str,
        statuses: &HashMap<String, StageStatus>,
    ) -> KeelPipedResult {
        let req = ReportDeploymentCompletedRequest {
            deployment_id: self.deployment.id.clone(),
            status,
            status_reason: reason.to_string(),
            stage_statuses: statuses.clone(),
            completed_at: now_unix(),
        };
        with_retry(&rpc_retry(), |_| {
            self.deps.client.report_deployment_completed(req.clone())
        })
        .await?;
        *self.done_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
        metrics::counter!(
            "keel_piped_deployments_completed_total",
            "status" => status.as_str()
        )
        .increment(1);
        info!(
            deployment_id = %self.deployment.id,
            status = status.as_str(),
            reason,
            notification = "DEPLOYMENT_COMPLETED",
            "deployment completed"
        );
        Ok(())
    }

    async fn report_most_recent_success(&self) -> KeelPipedResult {
        let d = &self.deployment;
        let req = ReportApplicationMostRecentDeploymentRequest {
            application_id: d.application_id.clone(),
            status: DeploymentStatus::Success,
            deployment: ApplicationDeploymentReference {
                deployment_id: d.id.clone(),
                trigger: d.trigger.clone(),
                summary: d.summary.clone(),
                version: d.version.clone(),
                started_at: d.created_at,
                completed_at: now_unix(),
            },
        };
        with_retry(&rpc_retry(), |_| {
            self.deps
                .client
                .report_application_most_recent_deployment(req.clone())
        })
        .await?;
        Ok(())
    }
}

fn stage_notification(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Success | StageStatus::Exited => "STAGE_SUCCEEDED",
        StageStatus::Cancelled => "STAGE_CANCELLED",
        StageStatus::Skipped => "STAGE_SKIPPED",
        _ => "STAGE_FAILED",
    }
}

/// A stage is skipped when the commit message starts with one of the
/// prefixes, or when every changed file matches one of the paths.
fn skip_by(opts: &SkipOptions, message: &str, changed: Option<&[String]>) -> Result<bool, String> {
    if opts
        .commit_message_prefixes
        .iter()
        .any(|p| !p.is_empty() && message.starts_with(p.as_str()))
    {
        return Ok(true);
    }
    let Some(changed) = changed else {
        return Ok(false);
    };
    if opts.paths.is_empty() || changed.is_empty() {
        return Ok(false);
    }
    let matcher = PathMatcher::new(&opts.paths).map_err(|e| e.to_string())?;
    Ok(matcher.matches_all(changed))
}
