use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use keel_common::{
    git::Client,
    model::{Command, CommandStatus, Deployment, DeploymentStatus},
    rpc::{
        InChainDeploymentPlannableRequest, PipedService, ReportDeploymentCompletedRequest,
        ReportDeploymentPlannedRequest,
    },
    time::now_unix,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::CommandStore,
    deploysource::Provider,
    error::{KeelPipedError, KeelPipedResult},
    planner::{self, PlannerInput, PlannerOutput},
};

#[derive(Clone)]
pub struct PlannerDeps {
    pub client: Arc<dyn PipedService>,
    pub git: Arc<Client>,
    pub commands: Arc<CommandStore>,
    pub planners: Arc<planner::Registry>,
}

/// Plans one pending deployment.
pub struct DeploymentPlanner {
    deployment: Deployment,
    work_dir: PathBuf,
    /// Commit of the last successful deployment, empty for the first one.
    running_commit: String,
    running_config_filename: String,
    deps: PlannerDeps,
    cancel_tx: watch::Sender<Option<Command>>,
    done: AtomicBool,
    done_status: Mutex<Option<DeploymentStatus>>,
}

enum Outcome {
    Planned(PlannerOutput),
    Failed(String),
    Cancelled(Command),
    Terminated,
}

impl DeploymentPlanner {
    pub fn new(
        deployment: Deployment,
        work_dir: PathBuf,
        running_commit: String,
        running_config_filename: String,
        deps: PlannerDeps,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(None);
        Self {
            deployment,
            work_dir,
            running_commit,
            running_config_filename,
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

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        let result = self.run_inner(&token).await;
        if let Err(e) = &result {
            error!(deployment_id = %self.deployment.id, "planner failed: {}", e);
        }
        self.done.store(true, Ordering::Release);
        result
    }

    async fn run_inner(&self, token: &CancellationToken) -> KeelPipedResult {
        let d = &self.deployment;
        info!(deployment_id = %d.id, application_id = %d.application_id, "start planning deployment");

        if d.is_in_chain() {
            let req = InChainDeploymentPlannableRequest {
                deployment_id: d.id.clone(),
                deployment_chain_id: d.deployment_chain_id.clone(),
                deployment_chain_block_index: d.deployment_chain_block_index,
            };
            let resp = with_retry(&rpc_retry(), |_| {
                self.deps.client.in_chain_deployment_plannable(req.clone())
            })
            .await?;
            if resp.cancel {
                return self.complete(DeploymentStatus::Cancelled, &resp.cancel_reason).await;
            }
            if !resp.plannable {
                info!(deployment_id = %d.id, "deployment is not plannable yet in its chain");
                return Ok(());
            }
        }

        let Some(planner) = self.deps.planners.planner(d.kind) else {
            return self
                .complete(
                    DeploymentStatus::Failure,
                    "Unable to find the planner for this application kind",
                )
                .await;
        };

        let mut cancel_rx = self.cancel_tx.subscribe();
        let cancelled = async move {
            loop {
                if let Some(cmd) = cancel_rx.borrow_and_update().clone() {
                    return cmd;
                }
                if cancel_rx.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Terminated,
            cmd = cancelled => Outcome::Cancelled(cmd),
            r = self.plan(planner.as_ref()) => match r {
                Ok(out) => Outcome::Planned(out),
                Err(e) => Outcome::Failed(e.to_string()),
            },
        };

        match outcome {
            Outcome::Terminated => Ok(()),
            Outcome::Planned(out) => self.report_planned(out).await,
            Outcome::Failed(err) => {
                self.complete(
                    DeploymentStatus::Failure,
                    &format!("Unable to plan the deployment ({})", err),
                )
                .await
            }
            Outcome::Cancelled(cmd) => {
                self.complete(
                    DeploymentStatus::Cancelled,
                    &format!("Deployment was cancelled by {} while planning", cmd.commander),
                )
                .await?;
                self.deps
                    .commands
                    .report_command_handled(&cmd, CommandStatus::Succeeded, HashMap::new(), None)
                    .await
            }
        }
    }

    async fn plan(&self, planner: &dyn planner::Planner) -> KeelPipedResult<PlannerOutput> {
        let d = &self.deployment;
        if d.trigger.commit.hash.is_empty() {
            return Err(KeelPipedError::InvalidConfig(
                "the deployment has no commit to deploy".into(),
            ));
        }
        let target = Provider::new(
            &self.work_dir.join("target-deploysource"),
            self.deps.git.clone(),
            d.git_path.clone(),
            d.kind,
            &d.trigger.commit.hash,
        )
        .get()
        .await?;
        let running = if self.running_commit.is_empty() {
            None
        } else {
            let source = Provider::new(
                &self.work_dir.join("running-deploysource"),
                self.deps.git.clone(),
                d.git_path.clone(),
                d.kind,
                &self.running_commit,
            )
            .get()
            .await?;
            Some(source)
        };
        let input = PlannerInput {
            deployment: d.clone(),
            running_commit: self.running_commit.clone(),
            target,
            running,
        };
        planner.plan(&input).await
    }

    async fn report_planned(&self, out: PlannerOutput) -> KeelPipedResult {
        let d = &self.deployment;
        let req = ReportDeploymentPlannedRequest {
            deployment_id: d.id.clone(),
            summary: out.summary,
            status_reason: "The deployment has been planned".to_string(),
            running_commit_hash: self.running_commit.clone(),
            running_config_filename: self.running_config_filename.clone(),
            version: out.version,
            stages: out.stages,
        };
        with_retry(&rpc_retry(), |_| {
            self.deps.client.report_deployment_planned(req.clone())
        })
        .await?;
        *self.done_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(DeploymentStatus::Planned);
        info!(deployment_id = %d.id, notification = "DEPLOYMENT_PLANNED", "deployment has been planned");
        Ok(())
    }

    async fn complete(&self, status: DeploymentStatus, reason: &str) -> KeelPipedResult {
        let req = ReportDeploymentCompletedRequest {
            deployment_id: self.deployment.id.clone(),
            status,
            status_reason: reason.to_string(),
            stage_statuses: HashMap::new(),
            completed_at: now_unix(),
        };
        with_retry(&rpc_retry(), |_| {
            self.deps.client.report_deployment_completed(req.clone())
        })
        .await?;
        *self.done_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
        info!(
            deployment_id = %self.deployment.id,
            status = status.as_str(),
            reason,
            "deployment completed while planning"
        );
        Ok(())
    }
}
