//! Assembles every component of the agent and runs them until shutdown.
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::PathBuf,
    sync::Arc,
};

use keel_common::{
    config::PipedSpec,
    git::{add_ssh_config, Client, ClientOptions},
    model::{
        ApplicationKind, CommandStatus, PipedPlatformProvider, PipedRepository,
        PipedSecretEncryption, SecretManagementType,
    },
    rpc::{PipedService, PipedToken, ReportPipedMetaRequest},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    admin::{self, AdminServer, StatsReporter, VERSION},
    apiclient::{rpc_retry, with_retry, HttpClient},
    apistore::{ApplicationStore, CommandStore, DeploymentStore, EventStore},
    appconfigreporter::AppConfigReporter,
    controller::Controller,
    driftdetector::{DriftDetector, KubernetesDiffer},
    error::KeelPipedResult,
    eventwatcher::EventWatcher,
    executor,
    kubernetes::{kube_client, ApplierRegistry, KubeApplier},
    livestatereporter::Reporter,
    livestatestore::{kubernetes::watched_kinds, KubernetesStore, MemoryStore, Registry},
    logpersister::Persister,
    planner,
    supervisor::Supervisor,
    toolregistry::ToolRegistry,
    trigger::{Trigger, ON_DEMAND_INTERVAL},
};

#[derive(Debug, Clone)]
pub struct PipedOptions {
    pub spec: PipedSpec,
    /// Talk to the control plane over plain HTTP.
    pub insecure: bool,
    pub admin_port: u16,
    /// Root of the working directories; a temporary directory when unset.
    pub workspace: Option<PathBuf>,
    pub tools_dir: Option<PathBuf>,
}

pub struct Piped {
    opts: PipedOptions,
}

impl Piped {
    pub fn new(opts: PipedOptions) -> Self {
        Self { opts }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        let spec = &self.opts.spec;
        let key = spec.load_piped_key()?;
        let piped_token = PipedToken::new(&spec.project_id, &spec.piped_id, &key);
        let client: Arc<dyn PipedService> = Arc::new(HttpClient::new(
            &spec.api_address,
            &piped_token,
            self.opts.insecure,
        )?);

        // Held until every component has stopped.
        let tmp = tempfile::Builder::new().prefix("keel-piped-").tempdir()?;
        let workspace = self
            .opts
            .workspace
            .clone()
            .unwrap_or_else(|| tmp.path().to_path_buf());
        fs::create_dir_all(&workspace)?;
        if let Some(dir) = &self.opts.tools_dir {
            ToolRegistry::init(dir.clone());
        }

        let metrics = admin::install_metrics()?;
        let git = Arc::new(self.git_client(&workspace)?);
        self.report_meta(&client).await?;

        let apps = Arc::new(ApplicationStore::new(client.clone(), spec.app_selector.clone()));
        let commands = Arc::new(CommandStore::new(client.clone()));
        let deployments = Arc::new(DeploymentStore::new(client.clone()));
        let events = Arc::new(EventStore::new(client.clone()));

        let appliers = Arc::new(ApplierRegistry::new());
        let mut live_stores = Registry::new();
        let mut drift = DriftDetector::new(
            client.clone(),
            git.clone(),
            apps.clone(),
            deployments.clone(),
            spec,
            &workspace.join("drift"),
        );
        let mut supervisor = Supervisor::new(token.clone());
        for provider in &spec.platform_providers {
            if provider.r#type != ApplicationKind::Kubernetes {
                continue;
            }
            let cfg = provider.kubernetes()?;
            match kube_client(&cfg).await {
                Ok(kube) => appliers.register(
                    &provider.name,
                    Arc::new(KubeApplier::new(kube, &cfg.namespace)),
                ),
                Err(e) => warn!(provider = %provider.name, "kubernetes is not reachable, deployments will fail: {}", e),
            }
            let store = Arc::new(MemoryStore::new());
            live_stores.register(&provider.name, store.clone());
            drift.register(
                &provider.name,
                Arc::new(KubernetesDiffer::new(store.clone(), watched_kinds(&cfg), &cfg.namespace)),
            );
            let watcher = KubernetesStore::new(&provider.name, cfg, store);
            let t = token.clone();
            supervisor.spawn("livestatestore", async move { watcher.run(t).await });
        }

        let controller = Arc::new(Controller::new(
            client.clone(),
            git.clone(),
            deployments.clone(),
            commands.clone(),
            Persister::new(client.clone()),
            planner::Registry::builtin(),
            executor::Registry::builtin(appliers),
            spec.platform_providers.iter().map(|p| p.name.clone()).collect::<HashSet<_>>(),
            &workspace.join("deployments"),
        ));
        let trigger = Arc::new(Trigger::new(
            client.clone(),
            git.clone(),
            apps.clone(),
            commands.clone(),
            deployments.clone(),
            spec,
            &workspace.join("trigger"),
        ));
        let watcher = Arc::new(EventWatcher::new(
            client.clone(),
            git.clone(),
            apps.clone(),
            events.clone(),
            spec,
            &workspace.join("eventwatcher"),
        ));
        let app_configs = Arc::new(AppConfigReporter::new(
            client.clone(),
            git.clone(),
            apps.clone(),
            spec,
            &workspace.join("appconfigreporter"),
        ));
        let reporter = Arc::new(Reporter::new(
            client.clone(),
            apps.clone(),
            live_stores,
            &spec.project_id,
            &spec.piped_id,
        ));
        let drift = Arc::new(drift);
        let stats = Arc::new(StatsReporter::new(client.clone(), metrics.clone()));
        let admin = Arc::new(AdminServer::new(self.opts.admin_port, metrics));

        macro_rules! spawn {
            ($name:literal, $component:expr) => {{
                let (c, t) = ($component.clone(), token.clone());
                supervisor.spawn($name, async move { c.run(t).await });
            }};
        }
        spawn!("applicationstore", apps);
        spawn!("commandstore", commands);
        spawn!("deploymentstore", deployments);
        spawn!("eventstore", events);
        spawn!("controller", controller);
        spawn!("trigger", trigger);
        spawn!("driftdetector", drift);
        spawn!("eventwatcher", watcher);
        spawn!("appconfigreporter", app_configs);
        spawn!("livestatereporter", reporter);
        spawn!("statsreporter", stats);
        spawn!("admin", admin);
        {
            let (commands, t) = (commands.clone(), token.clone());
            supervisor.spawn("restartwatcher", async move { watch_restart(commands, t).await });
        }

        info!(
            piped_id = %spec.piped_id,
            components = supervisor.len(),
            "piped has been started"
        );
        let result = supervisor.wait().await;
        if let Err(e) = git.clean() {
            warn!("failed to clean the git cache: {}", e);
        }
        info!("piped has been stopped");
        result
    }

    fn git_client(&self, workspace: &std::path::Path) -> KeelPipedResult<Client> {
        let git = &self.opts.spec.git;
        if git.should_configure_ssh_config() {
            let path = add_ssh_config(git)?;
            info!(path = %path.display(), "ssh config has been written");
        }
        let password = if git.password.is_empty() {
            String::new()
        } else {
            git.decoded_password()?
        };
        Ok(Client::new(ClientOptions {
            username: git.username().to_string(),
            email: git.email().to_string(),
            password,
            cache_dir: Some(workspace.join("git-cache")),
            ..Default::default()
        })?)
    }

    async fn report_meta(&self, client: &Arc<dyn PipedService>) -> KeelPipedResult {
        let spec = &self.opts.spec;
        let secret_encryption = match &spec.secret_management {
            Some(sm) if sm.r#type == SecretManagementType::KeyPair => {
                let public_key = sm
                    .key_pair
                    .as_ref()
                    .map(|kp| fs::read_to_string(&kp.public_key_file))
                    .transpose()?
                    .unwrap_or_default();
                Some(PipedSecretEncryption {
                    r#type: sm.r#type,
                    public_key,
                    encrypt_service_account: String::new(),
                })
            }
            Some(sm) => Some(PipedSecretEncryption {
                r#type: sm.r#type,
                public_key: String::new(),
                encrypt_service_account: String::new(),
            }),
            None => None,
        };
        let req = ReportPipedMetaRequest {
            version: VERSION.to_string(),
            platform_providers: spec
                .platform_providers
                .iter()
                .map(|p| PipedPlatformProvider {
                    name: p.name.clone(),
                    r#type: p.r#type.to_string(),
                })
                .collect(),
            repositories: spec
                .repositories
                .iter()
                .map(|r| PipedRepository {
                    id: r.repo_id.clone(),
                    remote: r.remote.clone(),
                    branch: r.branch.clone(),
                })
                .collect(),
            secret_encryption,
        };
        let resp = with_retry(&rpc_retry(), |_| client.report_piped_meta(req.clone())).await?;
        info!(name = %resp.name, web = %resp.web_base_url, "piped metadata has been reported");
        Ok(())
    }
}

/// Acknowledges a restart command and stops the agent so its supervisor
/// starts it again.
async fn watch_restart(commands: Arc<CommandStore>, token: CancellationToken) -> KeelPipedResult {
    let mut ticker = tokio::time::interval(ON_DEMAND_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let restarts = commands.list_restart_commands();
        if restarts.is_empty() {
            continue;
        }
        for cmd in &restarts {
            if let Err(e) = commands
                .report_command_handled(cmd, CommandStatus::Succeeded, HashMap::new(), None)
                .await
            {
                warn!(command_id = %cmd.id, "failed to report restart command: {}", e);
            }
        }
        info!(commander = %restarts[0].commander, "restarting piped on request");
        token.cancel();
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use keel_common::model::CommandType;

    use super::*;
    use crate::testing::{command, piped_spec, ControlPlane, PIPED, REPO_ID};

    #[tokio::test]
    async fn restart_commands_stop_the_agent() {
        let cp = ControlPlane::new().await;
        cp.add_command(&command("c1", CommandType::RestartPiped)).await;
        let commands = Arc::new(CommandStore::new(cp.client()));
        commands.sync().await.unwrap();

        let token = CancellationToken::new();
        watch_restart(commands, token.clone()).await.unwrap();
        assert!(token.is_cancelled());
        let cmd = cp.stores().commands.get("c1").await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Succeeded);
    }

    #[tokio::test]
    async fn piped_metadata_is_reported() {
        let cp = ControlPlane::new().await;
        let spec = piped_spec("https://github.com/org/repo.git");
        let piped = Piped::new(PipedOptions {
            spec,
            insecure: true,
            admin_port: 0,
            workspace: None,
            tools_dir: None,
        });
        piped.report_meta(&cp.client()).await.unwrap();
        let stored = cp.stores().pipeds.get(PIPED).await.unwrap();
        assert_eq!(stored.version, VERSION);
        assert_eq!(stored.repositories[0].id, REPO_ID);
    }
}
