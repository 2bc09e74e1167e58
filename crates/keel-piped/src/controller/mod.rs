//! Plans pending deployments and drives planned ones to completion.
//!
//! The controller looks at the deployment cache every tick and starts a
//! planner or a scheduler for each deployment it does not handle yet, at
//! most one per application. Each runs on its own task in a temporary
//! working directory removed when the task ends.
mod planner;
mod scheduler;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use keel_common::{
    git::Client,
    model::{Deployment, DeploymentStatus},
    rpc::{ApiCode, GetApplicationMostRecentDeploymentRequest, PipedService},
};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::planner::{DeploymentPlanner, PlannerDeps};
pub use self::scheduler::{Scheduler, SchedulerDeps};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::{CommandStore, DeploymentStore},
    error::KeelPipedResult,
    executor,
    logpersister::Persister,
    planner as planners,
};

const TICK_INTERVAL: Duration = Duration::from_secs(10);
const DONE_RETENTION: Duration = Duration::from_secs(60 * 60);

/// The last successful commit of an application and its config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RunningCommit {
    hash: String,
    config_filename: String,
}

pub struct Controller {
    client: Arc<dyn PipedService>,
    git: Arc<Client>,
    deployments: Arc<DeploymentStore>,
    commands: Arc<CommandStore>,
    persister: Persister,
    planners: Arc<planners::Registry>,
    executors: Arc<executor::Registry>,
    providers: Arc<HashSet<String>>,
    workspace: PathBuf,

    planning: DashMap<String, Arc<DeploymentPlanner>>,
    scheduling: DashMap<String, Arc<Scheduler>>,
    planned_done: DashMap<String, Instant>,
    scheduled_done: DashMap<String, Instant>,
    running_commits: DashMap<String, RunningCommit>,
    tasks: Mutex<JoinSet<()>>,
}

#[allow(clippy::too_many_arguments)]
impl Controller {
    pub fn new(
        client: Arc<dyn PipedService>,
        git: Arc<Client>,
        deployments: Arc<DeploymentStore>,
        commands: Arc<CommandStore>,
        persister: Persister,
        planners: planners::Registry,
        executors: executor::Registry,
        providers: HashSet<String>,
        workspace: &Path,
    ) -> Self {
        Self {
            client,
            git,
            deployments,
            commands,
            persister,
            planners: Arc::new(planners),
            executors: Arc::new(executors),
            providers: Arc::new(providers),
            workspace: workspace.to_path_buf(),
            planning: DashMap::new(),
            scheduling: DashMap::new(),
            planned_done: DashMap::new(),
            scheduled_done: DashMap::new(),
            running_commits: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        info!(workspace = %self.workspace.display(), "controller has been started");
        std::fs::create_dir_all(&self.workspace)?;

        // The log persister stops last so finishing stages can flush.
        let persister_token = CancellationToken::new();
        let persister = {
            let (persister, token) = (self.persister.clone(), persister_token.clone());
            tokio::spawn(async move { persister.run(token).await })
        };

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.tick(&token).await,
            }
        }

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        drop(tasks);
        persister_token.cancel();
        persister.await??;
        info!("controller has been stopped");
        Ok(())
    }

    /// One pass over the cached deployments.
    ///
    /// Running deployments are resumed before planned ones, and both before
    /// any planner starts, so a deployment interrupted by a restart keeps its
    /// application slot. Only the oldest pending deployment of an application
    /// is planned.
    pub async fn tick(&self, token: &CancellationToken) {
        self.reap().await;
        self.route_cancel_commands();
        let mut runnable = self.deployments.running();
        runnable.extend(self.deployments.planned());
        for d in runnable {
            self.start_scheduler(d, token).await;
        }
        for d in oldest_per_app(self.deployments.pending()) {
            self.start_planner(d, token).await;
        }
    }

    fn is_app_busy(&self, app_id: &str) -> bool {
        self.planning.iter().any(|p| p.application_id() == app_id)
            || self.scheduling.iter().any(|s| s.application_id() == app_id)
    }

    async fn start_planner(&self, d: Deployment, token: &CancellationToken) {
        if self.planning.contains_key(&d.id)
            || self.planned_done.contains_key(&d.id)
            || self.is_app_busy(&d.application_id)
        {
            return;
        }
        let running = match self.running_commit(&d).await {
            Ok(r) => r,
            Err(e) => {
                warn!(deployment_id = %d.id, "unable to find the last successful commit: {}", e);
                return;
            }
        };
        let work_dir = match self.work_dir(&d.id, "planner") {
            Ok(w) => w,
            Err(e) => {
                warn!(deployment_id = %d.id, "unable to create a working directory: {}", e);
                return;
            }
        };
        let deps = PlannerDeps {
            client: self.client.clone(),
            git: self.git.clone(),
            commands: self.commands.clone(),
            planners: self.planners.clone(),
        };
        let planner = Arc::new(DeploymentPlanner::new(
            d,
            work_dir.path().to_path_buf(),
            running.hash,
            running.config_filename,
            deps,
        ));
        self.planning
            .insert(planner.id().to_string(), planner.clone());
        let token = token.clone();
        self.tasks.lock().await.spawn(async move {
            let _ = planner.run(token).await;
            drop(work_dir);
        });
    }

    async fn start_scheduler(&self, d: Deployment, token: &CancellationToken) {
        if self.scheduling.contains_key(&d.id)
            || self.scheduled_done.contains_key(&d.id)
            || self.is_app_busy(&d.application_id)
        {
            return;
        }
        let work_dir = match self.work_dir(&d.id, "scheduler") {
            Ok(w) => w,
            Err(e) => {
                warn!(deployment_id = %d.id, "unable to create a working directory: {}", e);
                return;
            }
        };
        let deps = SchedulerDeps {
            client: self.client.clone(),
            git: self.git.clone(),
            commands: self.commands.clone(),
            persister: self.persister.clone(),
            executors: self.executors.clone(),
            providers: self.providers.clone(),
        };
        let scheduler = Arc::new(Scheduler::new(d, work_dir.path().to_path_buf(), deps));
        self.scheduling
            .insert(scheduler.id().to_string(), scheduler.clone());
        let token = token.clone();
        self.tasks.lock().await.spawn(async move {
            let _ = scheduler.run(token).await;
            drop(work_dir);
        });
    }

    fn work_dir(&self, id: &str, role: &str) -> std::io::Result<tempfile::TempDir> {
        tempfile::Builder::new()
            .prefix(&format!("{}-{}-", id, role))
            .tempdir_in(&self.workspace)
    }

    /// Forgets finished planners and schedulers. Deployments that reached a
    /// status are remembered for a while so a stale cache does not restart them.
    async fn reap(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            while tasks.try_join_next().is_some() {}
        }
        let now = Instant::now();
        let done: Vec<Arc<DeploymentPlanner>> = self
            .planning
            .iter()
            .filter(|p| p.is_done())
            .map(|p| p.value().clone())
            .collect();
        for p in done {
            self.planning.remove(p.id());
            if p.done_status().is_some() {
                self.planned_done.insert(p.id().to_string(), now);
            }
        }
        let done: Vec<Arc<Scheduler>> = self
            .scheduling
            .iter()
            .filter(|s| s.is_done())
            .map(|s| s.value().clone())
            .collect();
        for s in done {
            self.scheduling.remove(s.id());
            if let Some(status) = s.done_status() {
                self.scheduled_done.insert(s.id().to_string(), now);
                if status == DeploymentStatus::Success {
                    self.running_commits.remove(s.application_id());
                }
            }
        }
        self.planned_done
            .retain(|_, at| now.duration_since(*at) < DONE_RETENTION);
        self.scheduled_done
            .retain(|_, at| now.duration_since(*at) < DONE_RETENTION);
    }

    fn route_cancel_commands(&self) {
        for cmd in self.commands.list_cancel_commands() {
            if let Some(p) = self.planning.get(&cmd.deployment_id) {
                p.cancel(cmd);
            } else if let Some(s) = self.scheduling.get(&cmd.deployment_id) {
                s.cancel(cmd);
            }
        }
    }

    async fn running_commit(&self, d: &Deployment) -> KeelPipedResult<RunningCommit> {
        if let Some(c) = self.running_commits.get(&d.application_id) {
            return Ok(c.clone());
        }
        let req = GetApplicationMostRecentDeploymentRequest {
            application_id: d.application_id.clone(),
            status: DeploymentStatus::Success,
        };
        let commit = match with_retry(&rpc_retry(), |_| {
            self.client.get_application_most_recent_deployment(req.clone())
        })
        .await
        {
            Ok(resp) => RunningCommit {
                hash: resp.deployment.trigger.commit.hash,
                config_filename: d.git_path.config_filename().to_string(),
            },
            Err(e) if e.code == ApiCode::NotFound => RunningCommit::default(),
            Err(e) => return Err(e.into()),
        };
        self.running_commits
            .insert(d.application_id.clone(), commit.clone());
        Ok(commit)
    }
}

/// The oldest deployment of each application, oldest first.
fn oldest_per_app(mut deployments: Vec<Deployment>) -> Vec<Deployment> {
    deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    let mut seen = HashSet::new();
    deployments.retain(|d| seen.insert(d.application_id.clone()));
    deployments
}

#[cfg(test)]
mod tests {
    use keel_common::{
        git::ClientOptions,
        model::{CommandStatus, CommandType, StageStatus},
    };

    use super::*;
    use crate::testing::{app, command, deployment, ControlPlane, TestRepo, PROVIDER};

    struct Fixture {
        controller: Controller,
        deployments: Arc<DeploymentStore>,
        commands: Arc<CommandStore>,
        workspace: tempfile::TempDir,
    }

    fn fixture(cp: &ControlPlane, repo: &TestRepo, executors: executor::Registry) -> Fixture {
        let client = cp.client();
        let deployments = Arc::new(DeploymentStore::new(client.clone()));
        let commands = Arc::new(CommandStore::new(client.clone()));
        let workspace = tempfile::tempdir().unwrap();
        let git = Client::new(ClientOptions {
            cache_dir: Some(repo.scratch("cache")),
            ..Default::default()
        })
        .unwrap();
        let controller = Controller::new(
            client.clone(),
            Arc::new(git),
            deployments.clone(),
            commands.clone(),
            Persister::new(client),
            planners::Registry::builtin(),
            executors,
            HashSet::from([PROVIDER.to_string()]),
            workspace.path(),
        );
        Fixture {
            controller,
            deployments,
            commands,
            workspace,
        }
    }

    impl Fixture {
        async fn wait_tasks(&self) {
            let mut tasks = self.controller.tasks.lock().await;
            while tasks.join_next().await.is_some() {}
        }

        fn keys<T>(map: &DashMap<String, T>) -> Vec<String> {
            let mut keys: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
            keys.sort();
            keys
        }
    }

    #[tokio::test]
    async fn running_deployments_resume_before_newer_ones_are_planned() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let running = cp.add_deployment("d1", &["s1"]).await;
        let mut newer = deployment("d2", "a1");
        newer.created_at = cp.deployment("d1").await.created_at + 100;
        cp.stores().deployments.create(&newer).await.unwrap();
        assert_eq!(running.status, DeploymentStatus::Running);

        let f = fixture(&cp, &repo, scheduler::tests::registry(None));
        f.deployments.sync().await.unwrap();
        let token = CancellationToken::new();
        f.controller.tick(&token).await;

        assert_eq!(Fixture::keys(&f.controller.scheduling), vec!["d1".to_string()]);
        assert!(f.controller.planning.is_empty());
        token.cancel();
        f.wait_tasks().await;
    }

    #[tokio::test]
    async fn only_the_oldest_pending_deployment_of_an_app_is_planned() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        cp.add_app(&app("a1", "app/A", &repo.remote())).await;
        cp.add_app(&app("a2", "app/B", &repo.remote())).await;
        for (id, app_id, created_at) in [("d2", "a1", 200), ("d1", "a1", 100), ("d3", "a2", 300)] {
            let mut d = deployment(id, app_id);
            d.created_at = created_at;
            cp.stores().deployments.create(&d).await.unwrap();
        }

        let f = fixture(&cp, &repo, executor::Registry::new());
        f.deployments.sync().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        f.controller.tick(&token).await;

        assert_eq!(
            Fixture::keys(&f.controller.planning),
            vec!["d1".to_string(), "d3".to_string()]
        );
        f.wait_tasks().await;
    }

    #[tokio::test]
    async fn finished_schedulers_are_reaped_with_their_work_dirs() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        scheduler::tests::planned(&cp, &repo, "bump", scheduler::tests::pipeline_stages()).await;
        let f = fixture(&cp, &repo, scheduler::tests::registry(Some(StageStatus::Success)));
        f.deployments.sync().await.unwrap();

        let token = CancellationToken::new();
        f.controller.tick(&token).await;
        assert!(f.controller.scheduling.contains_key("d1"));
        f.wait_tasks().await;

        // The cache still lists d1 as planned; it must not start again.
        f.controller.tick(&token).await;
        assert!(f.controller.scheduling.is_empty());
        assert!(f.controller.scheduled_done.contains_key("d1"));
        assert_eq!(cp.deployment("d1").await.status, DeploymentStatus::Success);
        let leftovers: Vec<_> = std::fs::read_dir(f.workspace.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("d1-scheduler-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cancel_commands_reach_the_owning_scheduler() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        scheduler::tests::planned(&cp, &repo, "bump", scheduler::tests::pipeline_stages()).await;
        let f = fixture(&cp, &repo, scheduler::tests::registry(None));
        f.deployments.sync().await.unwrap();

        let token = CancellationToken::new();
        f.controller.tick(&token).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut cancel = command("c1", CommandType::CancelDeployment);
        cancel.application_id = "a1".to_string();
        cancel.deployment_id = "d1".to_string();
        cp.add_command(&cancel).await;
        f.commands.sync().await.unwrap();
        f.controller.tick(&token).await;
        f.wait_tasks().await;

        let stored = cp.deployment("d1").await;
        assert_eq!(stored.status, DeploymentStatus::Cancelled);
        assert!(stored.status_reason.starts_with("Cancelled by u1"));
        let handled = cp.stores().commands.get("c1").await.unwrap();
        assert_eq!(handled.status, CommandStatus::Succeeded);
    }

    #[test]
    fn keeps_the_oldest_deployment_per_app() {
        let mut a = deployment("a-new", "a1");
        a.created_at = 2;
        let mut b = deployment("a-old", "a1");
        b.created_at = 1;
        let mut c = deployment("b", "a2");
        c.created_at = 3;
        let ids: Vec<String> = oldest_per_app(vec![a, b, c]).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a-old".to_string(), "b".to_string()]);
    }
}
