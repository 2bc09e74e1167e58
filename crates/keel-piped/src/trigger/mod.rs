//! Decides which applications need a new deployment and submits it.
//!
//! Applications are checked periodically for new commits and drift, and
//! every ten seconds for sync commands. Candidates are grouped by
//! repository so each repository is pulled once per pass.
pub mod determiner;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use keel_common::{
    cache::LruMap,
    config::{parse_kind, GenericApplicationSpec, PipedSpec},
    error::KeelError,
    git::{self, make_commit_url, Client, Repo},
    model::{
        Application, ApplicationDeploymentReference, ApplicationSyncState,
        ApplicationSyncStatus, Command, CommandStatus, Commit, Deployment, DeploymentStatus,
        DeploymentTrigger, SyncStrategy, TriggerKind, METADATA_DEPLOYMENT_NOTIFICATION,
        METADATA_TRIGGERED_DEPLOYMENT_ID,
    },
    rpc::{
        ApiCode, ChainApplicationMatcher, CreateDeploymentChainRequest, CreateDeploymentRequest,
        PipedService, ReportApplicationMostRecentDeploymentRequest,
        ReportApplicationSyncStateRequest,
    },
    time::now_unix,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::{ApplicationStore, CommandStore, DeploymentStore},
    error::KeelPipedResult,
    repocache::RepoCache,
};

pub const ON_DEMAND_INTERVAL: Duration = Duration::from_secs(10);
const LAST_TRIGGERED_COMMITS_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
struct Candidate {
    app: Application,
    kind: TriggerKind,
    command: Option<Command>,
}

impl Candidate {
    fn sync_strategy(&self) -> SyncStrategy {
        let Some(cmd) = &self.command else {
            return SyncStrategy::Auto;
        };
        if let Some(sync) = &cmd.sync_application {
            return sync.sync_strategy;
        }
        cmd.chain_sync_application
            .as_ref()
            .map_or(SyncStrategy::Auto, |c| c.sync_strategy)
    }
}

pub struct Trigger {
    client: Arc<dyn PipedService>,
    apps: Arc<ApplicationStore>,
    commands: Arc<CommandStore>,
    deployments: Arc<DeploymentStore>,
    repos: RepoCache,
    sync_interval: Duration,
    last_triggered_commits: LruMap<String, String>,
}

impl Trigger {
    pub fn new(
        client: Arc<dyn PipedService>,
        git: Arc<Client>,
        apps: Arc<ApplicationStore>,
        commands: Arc<CommandStore>,
        deployments: Arc<DeploymentStore>,
        spec: &PipedSpec,
        workspace: &Path,
    ) -> Self {
        Self {
            client,
            apps,
            commands,
            deployments,
            repos: RepoCache::new(git, spec, workspace),
            sync_interval: spec.sync_interval.as_std(),
            last_triggered_commits: LruMap::new(LAST_TRIGGERED_COMMITS_CAPACITY),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        info!("deployment trigger has been started");
        let mut periodic = tokio::time::interval(self.sync_interval);
        let mut on_demand = tokio::time::interval(ON_DEMAND_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = periodic.tick() => self.check_periodic().await,
                _ = on_demand.tick() => self.check_on_demand().await,
            }
        }
        info!("deployment trigger has been stopped");
        Ok(())
    }

    /// Handles the sync commands addressed to this piped.
    pub async fn check_on_demand(&self) {
        let mut candidates = Vec::new();
        let commands = self
            .commands
            .list_application_commands()
            .into_iter()
            .map(|c| (c, TriggerKind::OnCommand))
            .chain(
                self.commands
                    .list_chain_sync_commands()
                    .into_iter()
                    .map(|c| (c, TriggerKind::OnChain)),
            );
        for (cmd, kind) in commands {
            let Some(app) = self.apps.get(&command_application_id(&cmd)) else {
                debug!(command_id = %cmd.id, "the application of the command is not known yet");
                continue;
            };
            candidates.push(Candidate {
                app,
                kind,
                command: Some(cmd),
            });
        }
        self.check(candidates).await;
    }

    /// Checks every application for new commits and drift.
    pub async fn check_periodic(&self) {
        let mut candidates = Vec::new();
        for app in self.apps.list().iter() {
            candidates.push(Candidate {
                app: app.clone(),
                kind: TriggerKind::OnCommit,
                command: None,
            });
            if app.sync_state.status == ApplicationSyncStatus::OutOfSync {
                candidates.push(Candidate {
                    app: app.clone(),
                    kind: TriggerKind::OnOutOfSync,
                    command: None,
                });
            }
        }
        self.check(candidates).await;
    }

    async fn check(&self, candidates: Vec<Candidate>) {
        let mut by_repo: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for c in candidates {
            by_repo
                .entry(c.app.git_path.repo.id.clone())
                .or_default()
                .push(c);
        }

        for (repo_id, candidates) in by_repo {
            let (repo, head) = match self.repos.fresh(&repo_id).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(repo_id = %repo_id, "failed to update repository: {}", e);
                    continue;
                }
            };

            let mut triggered = HashSet::new();
            for c in candidates {
                if c.command.is_none() && triggered.contains(&c.app.id) {
                    continue;
                }
                let result = self.check_candidate(&c, &repo, &head).await;
                if let Ok(Some(d)) = &result {
                    triggered.insert(d.application_id.clone());
                }
                self.handle_result(&c, result).await;
            }
        }
    }

    async fn handle_result(&self, c: &Candidate, result: KeelPipedResult<Option<Deployment>>) {
        let app_id = &c.app.id;
        let (status, metadata, output) = match result {
            Ok(Some(d)) => (
                CommandStatus::Succeeded,
                HashMap::from([(METADATA_TRIGGERED_DEPLOYMENT_ID.to_string(), d.id)]),
                None,
            ),
            Ok(None) => (
                CommandStatus::Failed,
                HashMap::new(),
                Some(format!(
                    "Triggering {} is disabled for this application",
                    c.kind
                )),
            ),
            Err(e) => {
                warn!(application_id = %app_id, trigger = %c.kind, "failed to trigger application: {}", e);
                (CommandStatus::Failed, HashMap::new(), Some(e.to_string()))
            }
        };
        let Some(cmd) = &c.command else {
            return;
        };
        if let Err(e) = self
            .commands
            .report_command_handled(cmd, status, metadata, output)
            .await
        {
            warn!(command_id = %cmd.id, "failed to report command handled: {}", e);
        }
    }

    /// Returns the submitted deployment, or `None` when the application did
    /// not need one.
    async fn check_candidate(
        &self,
        c: &Candidate,
        repo: &Repo,
        head: &git::Commit,
    ) -> KeelPipedResult<Option<Deployment>> {
        let app = &c.app;
        let cfg = match keel_common::config::load_application(
            repo.path(),
            &app.git_path.config_path(),
            app.kind,
        ) {
            Ok(cfg) => cfg,
            Err(e) => {
                let msg = match &e {
                    KeelError::InvalidConfig(msg) => msg.clone(),
                    other => other.to_string(),
                };
                self.report_invalid_config(app, &msg).await;
                return Err(e.into());
            }
        };

        let should = match c.kind {
            TriggerKind::OnCommand => determiner::on_command(&cfg),
            TriggerKind::OnChain => determiner::on_chain(&cfg),
            TriggerKind::OnOutOfSync => determiner::on_out_of_sync(
                &cfg,
                app,
                self.deployments.has_in_flight(&app.id),
                now_unix(),
            ),
            TriggerKind::OnCommit => {
                let last = self.last_triggered_commit(app);
                determiner::on_commit(&cfg, app, repo, &last, &head.hash).await?
            }
        };
        if !should {
            return Ok(None);
        }

        info!(
            application_id = %app.id,
            trigger = %c.kind,
            commit_hash = %head.hash,
            "application will be triggered to sync"
        );
        let d = self.trigger_deployment(c, &cfg, repo.cloned_branch(), head).await?;
        self.last_triggered_commits
            .put(app.id.clone(), head.hash.clone());
        Ok(Some(d))
    }

    fn last_triggered_commit(&self, app: &Application) -> String {
        self.last_triggered_commits
            .get(&app.id)
            .or_else(|| {
                app.most_recently_triggered_deployment
                    .as_ref()
                    .map(|d| d.trigger.commit.hash.clone())
            })
            .unwrap_or_default()
    }

    async fn trigger_deployment(
        &self,
        c: &Candidate,
        cfg: &GenericApplicationSpec,
        branch: &str,
        head: &git::Commit,
    ) -> KeelPipedResult<Deployment> {
        let mut d = build_deployment(c, cfg, branch, head, now_unix())?;

        let chain = cfg.chain().filter(|_| c.kind != TriggerKind::OnChain);
        if let Some(chain) = chain {
            let matchers: Vec<ChainApplicationMatcher> = chain
                .applications
                .iter()
                .map(|m| ChainApplicationMatcher {
                    name: m.name.clone(),
                    kind: parse_kind(&m.kind),
                    labels: m.labels.clone(),
                })
                .collect();
            let req = CreateDeploymentChainRequest {
                first_deployment: d.clone(),
                matchers,
            };
            let resp = with_retry(&rpc_retry(), |_| {
                self.client.create_deployment_chain(req.clone())
            })
            .await?;
            d.deployment_chain_id = resp.deployment_chain_id;
            d.deployment_chain_block_index = 0;
        } else {
            let req = CreateDeploymentRequest {
                deployment: d.clone(),
            };
            match with_retry(&rpc_retry(), |_| self.client.create_deployment(req.clone())).await {
                // A retried create whose first attempt went through.
                Err(e) if e.code == ApiCode::AlreadyExists => {}
                other => {
                    other?;
                }
            }
        }

        let mentioned = cfg
            .notification
            .as_ref()
            .map(|n| n.find_slack_accounts("EVENT_DEPLOYMENT_TRIGGERED"))
            .unwrap_or_default();
        info!(
            deployment_id = %d.id,
            application_id = %d.application_id,
            chain_id = %d.deployment_chain_id,
            notification = "DEPLOYMENT_TRIGGERED",
            mentioned = ?mentioned,
            "deployment has been triggered"
        );

        let req = ReportApplicationMostRecentDeploymentRequest {
            application_id: d.application_id.clone(),
            status: DeploymentStatus::Pending,
            deployment: ApplicationDeploymentReference::from(&d),
        };
        if let Err(e) = with_retry(&rpc_retry(), |_| {
            self.client
                .report_application_most_recent_deployment(req.clone())
        })
        .await
        {
            warn!(deployment_id = %d.id, "failed to report the most recently triggered deployment: {}", e);
        }
        Ok(d)
    }

    async fn report_invalid_config(&self, app: &Application, err: &str) {
        let state = ApplicationSyncState {
            status: ApplicationSyncStatus::InvalidConfig,
            short_reason: "Invalid application config".to_string(),
            reason: format!("Invalid application config ({})", err),
            head_deployment_id: app.sync_state.head_deployment_id.clone(),
            timestamp: now_unix(),
        };
        if !app.sync_state.has_changed(&state) {
            return;
        }
        let req = ReportApplicationSyncStateRequest {
            application_id: app.id.clone(),
            state,
        };
        if let Err(e) = with_retry(&rpc_retry(), |_| {
            self.client.report_application_sync_state(req.clone())
        })
        .await
        {
            warn!(application_id = %app.id, "failed to report invalid config: {}", e);
        }
    }
}

fn command_application_id(cmd: &Command) -> String {
    if !cmd.application_id.is_empty() {
        return cmd.application_id.clone();
    }
    cmd.sync_application
        .as_ref()
        .map(|s| s.application_id.clone())
        .or_else(|| {
            cmd.chain_sync_application
                .as_ref()
                .map(|s| s.application_id.clone())
        })
        .unwrap_or_default()
}

fn build_deployment(
    c: &Candidate,
    cfg: &GenericApplicationSpec,
    branch: &str,
    head: &git::Commit,
    now: i64,
) -> KeelPipedResult<Deployment> {
    let app = &c.app;
    let url = if app.git_path.repo.remote.is_empty() {
        String::new()
    } else {
        make_commit_url(&app.git_path.repo.remote, &head.hash).unwrap_or_else(|e| {
            debug!(application_id = %app.id, "unable to build the commit url: {}", e);
            String::new()
        })
    };

    let mut metadata = HashMap::new();
    if let Some(n) = cfg.notification.as_ref().filter(|n| !n.mentions.is_empty()) {
        metadata.insert(
            METADATA_DEPLOYMENT_NOTIFICATION.to_string(),
            serde_json::to_string(&n.mentions)?,
        );
    }

    let (chain_id, block_index) = match c.command.as_ref().and_then(|c| c.chain_sync_application.as_ref()) {
        Some(chain) if c.kind == TriggerKind::OnChain => {
            (chain.deployment_chain_id.clone(), chain.block_index)
        }
        _ => (String::new(), 0),
    };

    Ok(Deployment {
        id: uuid::Uuid::new_v4().to_string(),
        application_id: app.id.clone(),
        application_name: app.name.clone(),
        piped_id: app.piped_id.clone(),
        project_id: app.project_id.clone(),
        env_id: app.env_id.clone(),
        kind: app.kind,
        git_path: app.git_path.clone(),
        platform_provider: app.platform_provider.clone(),
        trigger: DeploymentTrigger {
            commit: Commit {
                hash: head.hash.clone(),
                message: head.message.clone(),
                author: head.author.clone(),
                branch: branch.to_string(),
                url,
                created_at: head.created_at,
            },
            commander: c
                .command
                .as_ref()
                .map(|cmd| cmd.commander.clone())
                .unwrap_or_default(),
            timestamp: now,
            sync_strategy: c.sync_strategy(),
            strategy_summary: String::new(),
        },
        status: DeploymentStatus::Pending,
        status_reason: "The deployment is waiting to be planned".to_string(),
        metadata,
        labels: app.labels.clone(),
        deployment_chain_id: chain_id,
        deployment_chain_block_index: block_index,
        created_at: now,
        updated_at: now,
        ..Default::default()
    })
}
