//! The application configuration file stored next to the application's
//! manifests in Git.
use std::{collections::HashMap, fs, io, path::Path};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{duration::Duration, event_watcher::EventWatcherReplacement, Envelope};
use crate::{
    error::{KeelError, KeelResult},
    model::ApplicationKind,
};

pub const DEFAULT_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
const DEFAULT_OUT_OF_SYNC_MIN_WINDOW: Duration = Duration::from_secs(5 * 60);
const ALL_EVENTS_SYMBOL: &str = "*";

/// The handler type used by the event watcher to update files in Git.
pub const EVENT_WATCHER_HANDLER_GIT_UPDATE: &str = "GIT_UPDATE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericApplicationSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub planner: DeploymentPlanner,
    #[serde(default)]
    pub commit_matcher: DeploymentCommitMatcher,
    #[serde(default)]
    pub pipeline: Option<DeploymentPipeline>,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub post_sync: Option<PostSync>,
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub notification: Option<DeploymentNotification>,
    #[serde(default)]
    pub event_watcher: Vec<EventWatcherConfig>,
    #[serde(default)]
    pub drift_detection: Option<DriftDetection>,
    /// Kind specific input such as the manifests of a Kubernetes application.
    #[serde(default)]
    pub input: serde_yaml::Value,
}

fn default_timeout() -> Duration {
    DEFAULT_DEPLOYMENT_TIMEOUT
}

impl Default for GenericApplicationSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            labels: HashMap::new(),
            description: String::new(),
            planner: DeploymentPlanner::default(),
            commit_matcher: DeploymentCommitMatcher::default(),
            pipeline: None,
            trigger: Trigger::default(),
            post_sync: None,
            timeout: default_timeout(),
            notification: None,
            event_watcher: Vec::new(),
            drift_detection: None,
            input: serde_yaml::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlanner {
    /// Always use the configured pipeline instead of auto detecting the strategy.
    #[serde(default)]
    pub always_use_pipeline: bool,
}

/// Regular expressions matched against the commit message to force a strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentCommitMatcher {
    #[serde(default)]
    pub quick_sync: String,
    #[serde(default)]
    pub pipeline: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPipeline {
    #[serde(default)]
    pub stages: Vec<PipelineStageConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStageConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Stage specific options, decoded by the executor of the stage.
    #[serde(default)]
    pub with: serde_yaml::Value,
    #[serde(default, alias = "skip")]
    pub skip_on: SkipOptions,
}

impl PipelineStageConfig {
    /// Decodes the `with` options, treating missing options as an empty mapping.
    pub fn options<T: serde::de::DeserializeOwned + Default>(&self) -> KeelResult<T> {
        if self.with.is_null() {
            return Ok(T::default());
        }
        Ok(serde_yaml::from_value(self.with.clone())?)
    }
}

/// Conditions under which a stage is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipOptions {
    #[serde(default)]
    pub commit_message_prefixes: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl SkipOptions {
    pub fn is_empty(&self) -> bool {
        self.commit_message_prefixes.is_empty() && self.paths.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(default)]
    pub on_commit: OnCommit,
    #[serde(default)]
    pub on_command: OnCommand,
    #[serde(default)]
    pub on_out_of_sync: OnOutOfSync,
    #[serde(default)]
    pub on_chain: OnChain,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnCommit {
    #[serde(default)]
    pub disabled: bool,
    /// Paths whose changes trigger the application in addition to its own directory.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Paths whose changes never trigger the application.
    #[serde(default)]
    pub ignores: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnCommand {
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnOutOfSync {
    #[serde(default = "default_true")]
    pub disabled: bool,
    /// Minimum time since the last deployment before another one is triggered.
    #[serde(default = "default_min_window")]
    pub min_window: Duration,
}

impl Default for OnOutOfSync {
    fn default() -> Self {
        Self {
            disabled: true,
            min_window: DEFAULT_OUT_OF_SYNC_MIN_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChain {
    #[serde(default = "default_true")]
    pub disabled: bool,
}

impl Default for OnChain {
    fn default() -> Self {
        Self { disabled: true }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_window() -> Duration {
    DEFAULT_OUT_OF_SYNC_MIN_WINDOW
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSync {
    #[serde(default)]
    pub chain: Option<DeploymentChainConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentChainConfig {
    #[serde(default)]
    pub applications: Vec<ChainApplicationMatcherConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainApplicationMatcherConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl DeploymentChainConfig {
    fn validate(&self) -> KeelResult {
        if self.applications.is_empty() {
            return Err(KeelError::InvalidConfig(
                "missing specified applications that will be triggered on this chain of deployment"
                    .into(),
            ));
        }
        for m in &self.applications {
            if m.name.is_empty() && m.kind.is_empty() && m.labels.is_empty() {
                return Err(KeelError::InvalidConfig(
                    "at least one of \"name\", \"kind\" or \"labels\" must be set to find applications to deploy"
                        .into(),
                ));
            }
            if !m.kind.is_empty() && parse_kind(&m.kind).is_none() {
                return Err(KeelError::InvalidConfig(format!(
                    "unknown application kind {:?} in chain",
                    m.kind
                )));
            }
        }
        Ok(())
    }
}

/// Accepts both `KUBERNETES` and `KubernetesApp` spellings.
pub fn parse_kind(kind: &str) -> Option<ApplicationKind> {
    ApplicationKind::ALL
        .into_iter()
        .find(|k| k.as_str().eq_ignore_ascii_case(kind))
        .or_else(|| ApplicationKind::from_config_kind(kind))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentNotification {
    #[serde(default)]
    pub mentions: Vec<NotificationMention>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMention {
    /// Event name without the `EVENT_` prefix, or `*` for every event.
    pub event: String,
    #[serde(default)]
    pub slack: Vec<String>,
    #[serde(default)]
    pub email: Vec<String>,
}

const NOTIFICATION_EVENTS: &[&str] = &[
    "DEPLOYMENT_TRIGGERED",
    "DEPLOYMENT_PLANNED",
    "DEPLOYMENT_STARTED",
    "DEPLOYMENT_APPROVED",
    "DEPLOYMENT_ROLLING_BACK",
    "DEPLOYMENT_SUCCEEDED",
    "DEPLOYMENT_FAILED",
    "DEPLOYMENT_CANCELLED",
    "DEPLOYMENT_WAIT_APPROVAL",
    "DEPLOYMENT_TRIGGER_FAILED",
    "STAGE_STARTED",
    "STAGE_SUCCEEDED",
    "STAGE_FAILED",
    "STAGE_CANCELLED",
    "STAGE_SKIPPED",
    "APPLICATION_SYNCED",
    "APPLICATION_OUT_OF_SYNC",
    "PIPED_STARTED",
    "PIPED_STOPPED",
];

impl NotificationMention {
    fn validate(&self) -> KeelResult {
        if self.event == ALL_EVENTS_SYMBOL || NOTIFICATION_EVENTS.contains(&self.event.as_str()) {
            return Ok(());
        }
        Err(KeelError::InvalidConfig(format!(
            "event {:?} is incorrect as notification event type",
            self.event
        )))
    }
}

impl DeploymentNotification {
    /// Slack accounts to mention for `event` (an `EVENT_*` name).
    pub fn find_slack_accounts(&self, event: &str) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .mentions
            .iter()
            .filter(|m| m.event == ALL_EVENTS_SYMBOL || format!("EVENT_{}", m.event) == event)
            .flat_map(|m| m.slack.iter().cloned())
            .collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftDetection {
    /// Entries in the form `apiVersion:kind:namespace:name#fieldPath`.
    #[serde(default)]
    pub ignore_fields: Vec<String>,
}

impl DriftDetection {
    fn validate(&self) -> KeelResult {
        for field in &self.ignore_fields {
            if field.split('#').count() != 2 {
                return Err(KeelError::InvalidConfig(
                    "ignoreFields must be in the form of 'apiVersion:kind:namespace:name#fieldPath'"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWatcherConfig {
    #[serde(default)]
    pub matcher: EventWatcherMatcher,
    #[serde(default)]
    pub handler: EventWatcherHandler,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWatcherMatcher {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWatcherHandler {
    #[serde(default, rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub config: EventWatcherHandlerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWatcherHandlerConfig {
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub make_pull_request: bool,
    #[serde(default)]
    pub replacements: Vec<EventWatcherReplacement>,
}

impl EventWatcherConfig {
    fn validate(&self) -> KeelResult {
        if self.matcher.name.is_empty() {
            return Err(KeelError::InvalidConfig(
                "eventWatcher matcher must have a name".into(),
            ));
        }
        if self.handler.r#type != EVENT_WATCHER_HANDLER_GIT_UPDATE {
            return Err(KeelError::InvalidConfig(format!(
                "unsupported eventWatcher handler type {:?}",
                self.handler.r#type
            )));
        }
        if self.handler.config.replacements.is_empty() {
            return Err(KeelError::InvalidConfig(format!(
                "eventWatcher {} must have at least one replacement",
                self.matcher.name
            )));
        }
        for r in &self.handler.config.replacements {
            r.validate()?;
        }
        Ok(())
    }
}

impl GenericApplicationSpec {
    pub fn validate(&self) -> KeelResult {
        if self.timeout.is_zero() {
            return Err(KeelError::InvalidConfig("timeout must be greater than 0".into()));
        }
        if let Some(pipeline) = &self.pipeline {
            for (i, stage) in pipeline.stages.iter().enumerate() {
                if stage.name.is_empty() {
                    return Err(KeelError::InvalidConfig(format!(
                        "stage {} in pipeline must have a name",
                        i
                    )));
                }
            }
        }
        for (name, pattern) in [
            ("quickSync", &self.commit_matcher.quick_sync),
            ("pipeline", &self.commit_matcher.pipeline),
        ] {
            if !pattern.is_empty() {
                Regex::new(pattern).map_err(|e| {
                    KeelError::InvalidConfig(format!("invalid commitMatcher.{}: {}", name, e))
                })?;
            }
        }
        if let Some(chain) = self.post_sync.as_ref().and_then(|p| p.chain.as_ref()) {
            chain.validate()?;
        }
        if let Some(n) = &self.notification {
            for m in &n.mentions {
                m.validate()?;
            }
        }
        if let Some(dd) = &self.drift_detection {
            dd.validate()?;
        }
        for ew in &self.event_watcher {
            ew.validate()?;
        }
        Ok(())
    }

    /// The configuration of a user defined stage, looked up by its index.
    pub fn stage(&self, index: i32) -> Option<&PipelineStageConfig> {
        let index = usize::try_from(index).ok()?;
        self.pipeline.as_ref()?.stages.get(index)
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.stages.iter().any(|s| s.name == name))
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline.as_ref().is_some_and(|p| !p.stages.is_empty())
    }

    pub fn chain(&self) -> Option<&DeploymentChainConfig> {
        self.post_sync.as_ref()?.chain.as_ref()
    }

    /// Decodes the kind specific `input` section.
    pub fn input<T: serde::de::DeserializeOwned + Default>(&self) -> KeelResult<T> {
        if self.input.is_null() {
            return Ok(T::default());
        }
        Ok(serde_yaml::from_value(self.input.clone())?)
    }
}

/// Input of a Kubernetes application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesInput {
    /// Manifest files relative to the application directory; empty means every YAML file.
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

impl Default for KubernetesInput {
    fn default() -> Self {
        Self {
            manifests: Vec::new(),
            namespace: String::new(),
            auto_rollback: true,
        }
    }
}

/// Input shared by the kinds without a dedicated executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericInput {
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

impl Default for GenericInput {
    fn default() -> Self {
        Self {
            auto_rollback: true,
        }
    }
}

/// A parsed application configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationConfig {
    pub kind: ApplicationKind,
    pub spec: GenericApplicationSpec,
}

impl ApplicationConfig {
    pub fn from_yaml(data: &str) -> KeelResult<Self> {
        let envelope = Envelope::from_yaml(data)?;
        let config_kind = serde_yaml::to_value(envelope.kind)?;
        let kind = config_kind
            .as_str()
            .and_then(ApplicationKind::from_config_kind)
            .ok_or_else(|| {
                KeelError::InvalidConfig(format!(
                    "{:?} is not an application configuration kind",
                    envelope.kind
                ))
            })?;
        let spec: GenericApplicationSpec = envelope.spec()?;
        spec.validate()?;
        Ok(Self { kind, spec })
    }
}

/// Loads the application configuration at `config_rel_path` inside a checked out repository.
pub fn load_application(
    repo_path: &Path,
    config_rel_path: &str,
    expected_kind: ApplicationKind,
) -> KeelResult<GenericApplicationSpec> {
    let data = match fs::read_to_string(repo_path.join(config_rel_path)) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(KeelError::InvalidConfig(format!(
                "application config file {} was not found in Git",
                config_rel_path
            )))
        }
        Err(e) => return Err(e.into()),
    };
    let cfg = ApplicationConfig::from_yaml(&data)?;
    if cfg.kind != expected_kind {
        return Err(KeelError::InvalidConfig(format!(
            "invalid application kind in the application config file, got: {}, expected: {}",
            cfg.kind, expected_kind
        )));
    }
    Ok(cfg.spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = r#"
apiVersion: keel.dev/v1beta1
kind: KubernetesApp
spec:
  name: hello
  labels:
    env: dev
  input:
    manifests:
      - deployment.yaml
    namespace: web
  commitMatcher:
    quickSync: "(?i)^hotfix"
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
        with:
          replicas: 10%
      - name: WAIT
        timeout: 10m
        with:
          duration: 30s
        skipOn:
          paths:
            - docs/**
      - name: K8S_PRIMARY_ROLLOUT
  trigger:
    onCommit:
      paths:
        - shared/
    onOutOfSync:
      disabled: false
  postSync:
    chain:
      applications:
        - name: downstream
  notification:
    mentions:
      - event: DEPLOYMENT_SUCCEEDED
        slack: [u1, u2]
      - event: "*"
        slack: [u3]
  eventWatcher:
    - matcher:
        name: image-tag
        labels:
          env: dev
      handler:
        type: GIT_UPDATE
        config:
          replacements:
            - file: values.yaml
              yamlField: $.image.tag
"#;

    #[test]
    fn parses_full_application_config() {
        let cfg = ApplicationConfig::from_yaml(APP).unwrap();
        assert_eq!(cfg.kind, ApplicationKind::Kubernetes);
        let spec = cfg.spec;
        assert_eq!(spec.name, "hello");
        assert_eq!(spec.timeout, DEFAULT_DEPLOYMENT_TIMEOUT);
        assert_eq!(spec.stage(1).unwrap().name, "WAIT");
        assert_eq!(
            spec.stage(1).unwrap().timeout,
            Some(Duration::from_secs(600))
        );
        assert_eq!(spec.stage(1).unwrap().skip_on.paths, vec!["docs/**"]);
        assert!(spec.stage(3).is_none());
        assert!(spec.stage(-1).is_none());
        assert!(spec.has_stage("K8S_PRIMARY_ROLLOUT"));
        assert!(!spec.trigger.on_out_of_sync.disabled);
        assert_eq!(spec.trigger.on_out_of_sync.min_window, Duration::from_secs(300));
        assert!(spec.trigger.on_chain.disabled);
        assert_eq!(spec.chain().unwrap().applications[0].name, "downstream");
        assert_eq!(spec.event_watcher[0].matcher.labels["env"], "dev");

        let input: KubernetesInput = spec.input().unwrap();
        assert_eq!(input.namespace, "web");
        assert!(input.auto_rollback);

        let n = spec.notification.unwrap();
        assert_eq!(n.find_slack_accounts("EVENT_DEPLOYMENT_SUCCEEDED"), vec!["u1", "u2", "u3"]);
        assert_eq!(n.find_slack_accounts("EVENT_DEPLOYMENT_FAILED"), vec!["u3"]);
    }

    #[test]
    fn skip_alias_is_accepted() {
        let stage: PipelineStageConfig =
            serde_yaml::from_str("name: WAIT\nskip:\n  paths: [\"docs/**\"]\n").unwrap();
        assert_eq!(stage.skip_on.paths, vec!["docs/**"]);
    }

    #[test]
    fn defaults_apply_to_empty_spec() {
        let cfg = ApplicationConfig::from_yaml("apiVersion: keel.dev/v1beta1\nkind: LambdaApp\n")
            .unwrap();
        assert_eq!(cfg.kind, ApplicationKind::Lambda);
        assert!(cfg.spec.trigger.on_out_of_sync.disabled);
        assert!(!cfg.spec.trigger.on_commit.disabled);
        assert!(!cfg.spec.has_pipeline());
        assert_eq!(cfg.spec.timeout, DEFAULT_DEPLOYMENT_TIMEOUT);
    }

    #[test]
    fn rejects_invalid_configs() {
        let cases = [
            "kind: Piped\nspec: {}\n",
            "kind: KubernetesApp\nspec:\n  postSync:\n    chain:\n      applications: []\n",
            "kind: KubernetesApp\nspec:\n  postSync:\n    chain:\n      applications:\n        - {}\n",
            "kind: KubernetesApp\nspec:\n  commitMatcher:\n    pipeline: \"(\"\n",
            "kind: KubernetesApp\nspec:\n  notification:\n    mentions:\n      - event: NOPE\n",
            "kind: KubernetesApp\nspec:\n  driftDetection:\n    ignoreFields: [\"a:b:c:d\"]\n",
            "kind: KubernetesApp\nspec:\n  eventWatcher:\n    - matcher: {name: a}\n      handler: {type: OTHER}\n",
        ];
        for case in cases {
            assert!(ApplicationConfig::from_yaml(case).is_err(), "{case}");
        }
    }

    #[test]
    fn load_checks_kind_and_existence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/app.keel.yaml"), APP).unwrap();

        let spec =
            load_application(dir.path(), "app/app.keel.yaml", ApplicationKind::Kubernetes).unwrap();
        assert_eq!(spec.name, "hello");

        let err = load_application(dir.path(), "app/app.keel.yaml", ApplicationKind::Ecs)
            .unwrap_err();
        assert!(err.to_string().contains("invalid application kind"));

        let err = load_application(dir.path(), "missing.yaml", ApplicationKind::Kubernetes)
            .unwrap_err();
        assert!(err.to_string().contains("was not found in Git"));
    }

    #[test]
    fn parses_both_kind_spellings() {
        assert_eq!(parse_kind("KUBERNETES"), Some(ApplicationKind::Kubernetes));
        assert_eq!(parse_kind("ECSApp"), Some(ApplicationKind::Ecs));
        assert_eq!(parse_kind("nope"), None);
    }
}
