//! Stage executors and the signal used to stop them.
//!
//! An executor runs one stage to completion and maps the outcome to a
//! [`StageStatus`]. It is expected to watch its [`StopSignal`] at every
//! suspension point and return promptly once a signal arrives.
mod kubernetes;
mod script_run;
mod wait;
mod wait_approval;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use keel_common::{
    config::{GenericApplicationSpec, PipelineStageConfig},
    model::{stage, ApplicationKind, Deployment, PipelineStage, StageStatus},
};
use tokio::sync::watch;

pub use self::kubernetes::{KubernetesAction, KubernetesExecutor};
pub use script_run::{ScriptRunExecutor, ScriptRunOptions};
pub use wait::{WaitExecutor, WaitStageOptions};
pub use wait_approval::{WaitApprovalExecutor, WaitApprovalStageOptions};

use crate::{
    apistore::CommandStore, deploysource::DeploySource, kubernetes::ApplierRegistry,
    logpersister::StageLogPersister, metadatastore::MetadataStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignalType {
    Cancel,
    Timeout,
    Terminate,
}

impl StopSignalType {
    /// Stage status an executor returns when stopped by this signal.
    /// Termination is never reported by the scheduler.
    pub fn stage_status(&self) -> StageStatus {
        match self {
            StopSignalType::Cancel => StageStatus::Cancelled,
            StopSignalType::Timeout | StopSignalType::Terminate => StageStatus::Failure,
        }
    }
}

/// Receiving half handed to executors.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<StopSignalType>>,
}

/// Sending half kept by the scheduler. Only the first signal is kept.
#[derive(Debug)]
pub struct StopSignalHandler {
    tx: watch::Sender<Option<StopSignalType>>,
}

pub fn new_stop_signal() -> (StopSignal, StopSignalHandler) {
    let (tx, rx) = watch::channel(None);
    (StopSignal { rx }, StopSignalHandler { tx })
}

impl StopSignal {
    pub fn signal(&self) -> Option<StopSignalType> {
        *self.rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.signal().is_some()
    }

    /// Resolves once a signal has been sent. Never resolves if the handler is
    /// dropped without signalling.
    pub async fn stopped(&self) -> StopSignalType {
        let mut rx = self.rx.clone();
        loop {
            if let Some(sig) = *rx.borrow_and_update() {
                return sig;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

impl StopSignalHandler {
    /// Returns whether this signal won.
    pub fn send(&self, sig: StopSignalType) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(sig);
            true
        })
    }

    pub fn cancel(&self) -> bool {
        self.send(StopSignalType::Cancel)
    }

    pub fn timeout(&self) -> bool {
        self.send(StopSignalType::Timeout)
    }

    pub fn terminate(&self) -> bool {
        self.send(StopSignalType::Terminate)
    }

    pub fn signal(&self) -> Option<StopSignalType> {
        *self.tx.borrow()
    }
}

/// Everything an executor may look at while running one stage.
pub struct ExecutorInput {
    pub deployment: Deployment,
    pub stage: PipelineStage,
    pub stage_config: PipelineStageConfig,
    pub app_config: GenericApplicationSpec,
    pub target_source: Arc<DeploySource>,
    pub running_source: Option<Arc<DeploySource>>,
    pub log: StageLogPersister,
    pub metadata: Arc<MetadataStore>,
    pub commands: Arc<CommandStore>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageStatus;
}

/// Executors by stage name, plus the rollback executor of every kind.
#[derive(Default, Clone)]
pub struct Registry {
    executors: HashMap<String, Arc<dyn Executor>>,
    rollbacks: HashMap<ApplicationKind, Arc<dyn Executor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin(appliers: Arc<ApplierRegistry>) -> Self {
        Self::with_approval_interval(appliers, wait_approval::DEFAULT_CHECK_INTERVAL)
    }

    pub fn with_approval_interval(appliers: Arc<ApplierRegistry>, interval: Duration) -> Self {
        let mut r = Self::new();
        r.register(stage::WAIT, Arc::new(WaitExecutor));
        r.register(stage::WAIT_APPROVAL, Arc::new(WaitApprovalExecutor::new(interval)));
        r.register(stage::SCRIPT_RUN, Arc::new(ScriptRunExecutor::new(false)));
        r.register(stage::SCRIPT_RUN_ROLLBACK, Arc::new(ScriptRunExecutor::new(true)));
        for (name, action) in [
            (stage::K8S_SYNC, KubernetesAction::Sync),
            (stage::K8S_PRIMARY_ROLLOUT, KubernetesAction::PrimaryRollout),
            (stage::K8S_CANARY_ROLLOUT, KubernetesAction::CanaryRollout),
            (stage::K8S_CANARY_CLEAN, KubernetesAction::CanaryClean),
        ] {
            r.register(name, Arc::new(KubernetesExecutor::new(appliers.clone(), action)));
        }
        let rollback: Arc<dyn Executor> =
            Arc::new(KubernetesExecutor::new(appliers, KubernetesAction::Rollback));
        r.register(stage::K8S_ROLLBACK, rollback.clone());
        r.register_rollback(ApplicationKind::Kubernetes, rollback);
        r
    }

    pub fn register(&mut self, stage_name: &str, executor: Arc<dyn Executor>) {
        self.executors.insert(stage_name.to_string(), executor);
    }

    pub fn register_rollback(&mut self, kind: ApplicationKind, executor: Arc<dyn Executor>) {
        self.rollbacks.insert(kind, executor);
    }

    /// The executor of a stage. Predefined rollback stages go to the rollback
    /// executor of the kind when no executor is registered under their name.
    pub fn executor(&self, stage: &PipelineStage, kind: ApplicationKind) -> Option<Arc<dyn Executor>> {
        if let Some(e) = self.executors.get(&stage.name) {
            return Some(e.clone());
        }
        if stage.rollback {
            return self.rollbacks.get(&kind).cloned();
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use keel_common::{config::ApplicationConfig, git::ClientOptions};

    use super::*;
    use crate::{
        deploysource::Provider,
        logpersister::Persister,
        testing::{app, ControlPlane, TestRepo},
    };

    /// Commits `files` under `app/A` and checks the commit out.
    pub async fn source(repo: &TestRepo, files: &[(&str, &str)]) -> Arc<DeploySource> {
        for (path, content) in files {
            repo.write(&format!("app/A/{}", path), content);
        }
        let hash = repo.commit("add app");
        let git = Arc::new(
            keel_common::git::Client::new(ClientOptions {
                cache_dir: Some(repo.scratch("cache")),
                ..Default::default()
            })
            .unwrap(),
        );
        let git_path = app("a1", "app/A", &repo.remote()).git_path;
        let work = repo.scratch(&format!("work-{}", &hash[..7]));
        Provider::new(&work, git, git_path, ApplicationKind::Kubernetes, &hash)
            .get()
            .await
            .unwrap()
    }

    pub async fn input(
        cp: &ControlPlane,
        stage: PipelineStage,
        stage_config: PipelineStageConfig,
        target: Arc<DeploySource>,
        running: Option<Arc<DeploySource>>,
    ) -> ExecutorInput {
        let mut deployment = cp.add_deployment("d1", &[&stage.id]).await;
        deployment.stages = vec![stage.clone()];
        let commands = Arc::new(CommandStore::new(cp.client()));
        commands.sync().await.unwrap();
        ExecutorInput {
            metadata: Arc::new(MetadataStore::new(cp.client(), &deployment)),
            log: Persister::new(cp.client()).stage_log_persister(&deployment.id, &stage.id, 0),
            app_config: target.app_config.clone(),
            deployment,
            stage,
            stage_config,
            target_source: target,
            running_source: running,
            commands,
        }
    }

    pub fn app_config(yaml: &str) -> GenericApplicationSpec {
        ApplicationConfig::from_yaml(yaml).unwrap().spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_signal_wins() {
        let (sig, handler) = new_stop_signal();
        assert!(!sig.is_stopped());
        assert!(handler.cancel());
        assert!(!handler.terminate());
        assert_eq!(sig.signal(), Some(StopSignalType::Cancel));
        assert_eq!(sig.stopped().await, StopSignalType::Cancel);
        assert_eq!(StopSignalType::Timeout.stage_status(), StageStatus::Failure);
    }

    #[tokio::test]
    async fn stopped_waits_for_a_later_signal() {
        let (sig, handler) = new_stop_signal();
        let waiter = tokio::spawn(async move { sig.stopped().await });
        tokio::task::yield_now().await;
        handler.timeout();
        assert_eq!(waiter.await.unwrap(), StopSignalType::Timeout);
    }

    #[test]
    fn rollback_stages_fall_back_to_the_kind() {
        let registry = Registry::builtin(Arc::new(ApplierRegistry::new()));
        let rollback = PipelineStage {
            name: stage::ROLLBACK.to_string(),
            rollback: true,
            ..Default::default()
        };
        assert!(registry.executor(&rollback, ApplicationKind::Kubernetes).is_some());
        assert!(registry.executor(&rollback, ApplicationKind::Terraform).is_none());
        let wait = PipelineStage {
            name: stage::WAIT.to_string(),
            ..Default::default()
        };
        assert!(registry.executor(&wait, ApplicationKind::Lambda).is_some());
    }
}
