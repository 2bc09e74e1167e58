//! Fixtures shared by the agent tests: an in-process control plane and
//! throwaway git remotes.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command as StdCommand,
    sync::Arc,
};

use keel_common::{
    config::{Duration, PipedEventWatcher, PipedGit, PipedPlatformProviderConfig, PipedRepositoryConfig, PipedSpec},
    model::{
        Application, ApplicationGitPath, ApplicationGitRepository, ApplicationKind, Command,
        CommandStatus, CommandType, Deployment, DeploymentStatus, Environment, Event,
        PipelineStage, Piped, PipedStat, StageStatus,
    },
    rpc::{PipedService, PipedToken},
};
use keel_database::{LocalFileStore, MemoryDataStore, Stores};
use keel_server::{LocalClient, PipedApi};
use tempfile::TempDir;

pub const PROJECT: &str = "proj";
pub const PIPED: &str = "p1";
pub const KEY: &str = "piped-key";
pub const REPO_ID: &str = "repo-1";
pub const PROVIDER: &str = "kubernetes-default";

pub struct ControlPlane {
    api: Arc<PipedApi>,
    _dir: TempDir,
}

impl ControlPlane {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(
            Arc::new(MemoryDataStore::new()),
            Arc::new(LocalFileStore::new(dir.path())),
        );
        stores
            .pipeds
            .create(&Piped {
                id: PIPED.to_string(),
                name: "piped".to_string(),
                project_id: PROJECT.to_string(),
                key_hash: Piped::hash_key(KEY),
                ..Default::default()
            })
            .await
            .unwrap();
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
        Self {
            api: Arc::new(PipedApi::new(stores, "https://keel.example.com")),
            _dir: dir,
        }
    }

    pub fn client(&self) -> Arc<dyn PipedService> {
        Arc::new(LocalClient::new(
            self.api.clone(),
            PipedToken::new(PROJECT, PIPED, KEY),
        ))
    }

    pub fn stores(&self) -> &Stores {
        self.api.stores()
    }

    pub fn piped_stat(&self, piped_id: &str) -> Option<PipedStat> {
        self.api.piped_stat(piped_id)
    }

    pub async fn add_app(&self, app: &Application) {
        self.stores().applications.create(app).await.unwrap();
    }

    pub async fn add_command(&self, cmd: &Command) {
        self.stores().commands.create(cmd).await.unwrap();
    }

    /// A RUNNING deployment of application `a1` with one WAIT stage per id.
    pub async fn add_deployment(&self, id: &str, stage_ids: &[&str]) -> Deployment {
        if self.stores().applications.get("a1").await.is_err() {
            self.add_app(&app("a1", "app/A", "")).await;
        }
        let mut d = deployment(id, "a1");
        d.status = DeploymentStatus::Running;
        d.stages = stage_ids
            .iter()
            .enumerate()
            .map(|(i, s)| stage(s, "WAIT", i as i32, &[]))
            .collect();
        self.stores().deployments.create(&d).await.unwrap();
        d
    }

    pub async fn deployment(&self, id: &str) -> Deployment {
        self.stores().deployments.get(id).await.unwrap()
    }
}

pub fn app(id: &str, path: &str, remote: &str) -> Application {
    Application {
        id: id.to_string(),
        name: id.to_string(),
        project_id: PROJECT.to_string(),
        piped_id: PIPED.to_string(),
        env_id: "env".to_string(),
        kind: ApplicationKind::Kubernetes,
        platform_provider: PROVIDER.to_string(),
        git_path: ApplicationGitPath {
            repo: ApplicationGitRepository {
                id: REPO_ID.to_string(),
                remote: remote.to_string(),
                branch: "main".to_string(),
            },
            path: path.to_string(),
            ..Default::default()
        },
        labels: HashMap::from([("env".to_string(), "dev".to_string())]),
        ..Default::default()
    }
}

pub fn deployment(id: &str, app_id: &str) -> Deployment {
    Deployment {
        id: id.to_string(),
        application_id: app_id.to_string(),
        application_name: app_id.to_string(),
        piped_id: PIPED.to_string(),
        project_id: PROJECT.to_string(),
        env_id: "env".to_string(),
        platform_provider: PROVIDER.to_string(),
        status: DeploymentStatus::Pending,
        ..Default::default()
    }
}

pub fn stage(id: &str, name: &str, index: i32, requires: &[&str]) -> PipelineStage {
    PipelineStage {
        id: id.to_string(),
        name: name.to_string(),
        index,
        requires: requires.iter().map(|s| s.to_string()).collect(),
        visible: true,
        status: StageStatus::NotStartedYet,
        ..Default::default()
    }
}

pub fn command(id: &str, r#type: CommandType) -> Command {
    Command {
        id: id.to_string(),
        piped_id: PIPED.to_string(),
        project_id: PROJECT.to_string(),
        application_id: String::new(),
        deployment_id: String::new(),
        stage_id: String::new(),
        r#type,
        commander: "u1".to_string(),
        handled: false,
        status: CommandStatus::NotHandledYet,
        metadata: HashMap::new(),
        output_blob_key: String::new(),
        handled_at: 0,
        sync_application: None,
        chain_sync_application: None,
        created_at: 0,
        updated_at: 0,
    }
}

pub fn event(id: &str, name: &str, env: &str, created_at: i64) -> Event {
    Event {
        id: id.to_string(),
        name: name.to_string(),
        labels: HashMap::from([("env".to_string(), env.to_string())]),
        data: "v2".to_string(),
        project_id: PROJECT.to_string(),
        created_at,
        ..Default::default()
    }
}

pub fn piped_spec(remote: &str) -> PipedSpec {
    PipedSpec {
        project_id: PROJECT.to_string(),
        piped_id: PIPED.to_string(),
        piped_key_file: String::new(),
        piped_key_data: String::new(),
        api_address: "localhost:9080".to_string(),
        web_address: String::new(),
        sync_interval: Duration::from_secs(60),
        git: PipedGit::default(),
        repositories: vec![PipedRepositoryConfig {
            repo_id: REPO_ID.to_string(),
            remote: remote.to_string(),
            branch: "main".to_string(),
        }],
        platform_providers: vec![PipedPlatformProviderConfig {
            name: PROVIDER.to_string(),
            r#type: ApplicationKind::Kubernetes,
            config: serde_yaml::Value::Null,
        }],
        analysis_providers: Vec::new(),
        notifications: serde_yaml::Value::Null,
        secret_management: None,
        event_watcher: PipedEventWatcher::default(),
        app_selector: HashMap::new(),
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .unwrap();
    assert!(out.status.success(), "{:?}", out);
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// A bare remote on `main` plus a seed working copy used to push commits.
pub struct TestRepo {
    root: TempDir,
    remote: PathBuf,
    seed: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let remote = root.path().join("remote.git");
        let seed = root.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        git(root.path(), &["init", "--bare", "-b", "main", remote.to_str().unwrap()]);
        git(&seed, &["init", "-b", "main"]);
        git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);
        let repo = Self { root, remote, seed };
        repo.write("README.md", "keel\n");
        repo.commit("initial");
        repo
    }

    pub fn remote(&self) -> String {
        self.remote.to_string_lossy().into_owned()
    }

    /// A scratch directory living as long as the repo.
    pub fn scratch(&self, name: &str) -> PathBuf {
        let dir = self.root.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn write(&self, path: &str, content: &str) {
        let file = self.seed.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, content).unwrap();
    }

    pub fn remove(&self, path: &str) {
        std::fs::remove_file(self.seed.join(path)).unwrap();
    }

    /// Commits everything in the seed, pushes it and returns the new hash.
    pub fn commit(&self, message: &str) -> String {
        git(&self.seed, &["add", "."]);
        git(&self.seed, &["commit", "-m", message]);
        git(&self.seed, &["push", "origin", "main"]);
        git(&self.seed, &["rev-parse", "HEAD"]).trim().to_string()
    }

    /// Pulls whatever others pushed into the seed.
    pub fn sync(&self) {
        git(&self.seed, &["pull", "--no-rebase", "origin", "main"]);
    }

    /// Content of `path` at the tip of the remote `main`.
    pub fn read_remote(&self, path: &str) -> String {
        git(&self.remote, &["show", &format!("main:{}", path)])
    }

    /// Message of the tip commit of the remote `main`.
    pub fn head_message(&self) -> String {
        git(&self.remote, &["log", "-1", "--format=%B", "main"])
    }
}
