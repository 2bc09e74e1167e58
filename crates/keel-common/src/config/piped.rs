//! Agent (piped) configuration.
use std::{collections::HashSet, fs, path::Path};

use base64::Engine;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use super::{duration::Duration, ConfigKind, Envelope};
use crate::{
    error::{KeelError, KeelResult},
    model::{ApplicationKind, PipedPlatformProvider, PipedRepository, SecretManagementType},
};

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_EVENT_WATCHER_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_GIT_USERNAME: &str = "piped";
const DEFAULT_GIT_EMAIL: &str = "keel@localhost";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedSpec {
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(rename = "pipedID")]
    pub piped_id: String,
    #[serde(default)]
    pub piped_key_file: String,
    /// Base64 encoded piped key, used when no key file is given.
    #[serde(default)]
    pub piped_key_data: String,
    pub api_address: String,
    #[serde(default)]
    pub web_address: String,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: Duration,
    #[serde(default)]
    pub git: PipedGit,
    #[serde(default)]
    pub repositories: Vec<PipedRepositoryConfig>,
    #[serde(default)]
    pub platform_providers: Vec<PipedPlatformProviderConfig>,
    #[serde(default)]
    pub analysis_providers: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub notifications: serde_yaml::Value,
    #[serde(default)]
    pub secret_management: Option<SecretManagement>,
    #[serde(default)]
    pub event_watcher: PipedEventWatcher,
    /// Only applications whose labels contain all of these are handled.
    #[serde(default)]
    pub app_selector: std::collections::HashMap<String, String>,
}

fn default_sync_interval() -> Duration {
    DEFAULT_SYNC_INTERVAL
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedGit {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub ssh_config_file_path: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub ssh_key_file: String,
    /// Base64 encoded private key.
    #[serde(default)]
    pub ssh_key_data: String,
    /// Base64 encoded password for HTTPS remotes.
    #[serde(default)]
    pub password: String,
}

impl PipedGit {
    pub fn should_configure_ssh_config(&self) -> bool {
        !self.ssh_key_file.is_empty() || !self.ssh_key_data.is_empty()
    }

    pub fn username(&self) -> &str {
        if self.username.is_empty() {
            DEFAULT_GIT_USERNAME
        } else {
            &self.username
        }
    }

    pub fn email(&self) -> &str {
        if self.email.is_empty() {
            DEFAULT_GIT_EMAIL
        } else {
            &self.email
        }
    }

    pub fn decoded_password(&self) -> KeelResult<String> {
        decode_base64(&self.password, "git password")
    }

    pub fn load_ssh_key(&self) -> KeelResult<Vec<u8>> {
        if !self.ssh_key_file.is_empty() && !self.ssh_key_data.is_empty() {
            return Err(KeelError::InvalidConfig(
                "only either sshKeyFile or sshKeyData can be set".into(),
            ));
        }
        if !self.ssh_key_data.is_empty() {
            return Ok(decode_base64(&self.ssh_key_data, "ssh key")?.into_bytes());
        }
        if !self.ssh_key_file.is_empty() {
            return Ok(fs::read(&self.ssh_key_file)?);
        }
        Err(KeelError::InvalidConfig("either sshKeyFile or sshKeyData must be set".into()))
    }

    fn validate(&self) -> KeelResult {
        if !self.password.is_empty() && self.should_configure_ssh_config() {
            return Err(KeelError::InvalidConfig(
                "cannot configure both sshKey and password authentication".into(),
            ));
        }
        if !self.password.is_empty() && self.username.is_empty() {
            return Err(KeelError::InvalidConfig(
                "username must be set when using password authentication".into(),
            ));
        }
        if !self.ssh_key_file.is_empty() && !self.ssh_key_data.is_empty() {
            return Err(KeelError::InvalidConfig(
                "only either sshKeyFile or sshKeyData can be set".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedRepositoryConfig {
    pub repo_id: String,
    pub remote: String,
    #[serde(default)]
    pub branch: String,
}

impl From<&PipedRepositoryConfig> for PipedRepository {
    fn from(r: &PipedRepositoryConfig) -> Self {
        PipedRepository {
            id: r.repo_id.clone(),
            remote: r.remote.clone(),
            branch: r.branch.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedPlatformProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: ApplicationKind,
    /// Provider specific configuration.
    #[serde(default)]
    pub config: serde_yaml::Value,
}

impl PipedPlatformProviderConfig {
    pub fn kubernetes(&self) -> KeelResult<KubernetesProviderConfig> {
        if self.config.is_null() {
            return Ok(KubernetesProviderConfig::default());
        }
        Ok(serde_yaml::from_value(self.config.clone())?)
    }
}

impl From<&PipedPlatformProviderConfig> for PipedPlatformProvider {
    fn from(p: &PipedPlatformProviderConfig) -> Self {
        PipedPlatformProvider {
            name: p.name.clone(),
            r#type: p.r#type.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesProviderConfig {
    /// Namespace to watch; empty means every namespace.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub kubeconfig_path: String,
    #[serde(default)]
    pub app_state_informer: KubernetesAppStateInformer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAppStateInformer {
    #[serde(default)]
    pub include_resources: Vec<KubernetesResourceMatcher>,
    #[serde(default)]
    pub exclude_resources: Vec<KubernetesResourceMatcher>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesResourceMatcher {
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManagement {
    #[serde(rename = "type")]
    pub r#type: SecretManagementType,
    #[serde(default)]
    pub key_pair: Option<SecretManagementKeyPair>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManagementKeyPair {
    pub private_key_file: String,
    pub public_key_file: String,
}

impl SecretManagement {
    fn validate(&self) -> KeelResult {
        if self.r#type == SecretManagementType::KeyPair {
            let kp = self.key_pair.as_ref().ok_or_else(|| {
                KeelError::InvalidConfig("keyPair must be set for KEY_PAIR secret management".into())
            })?;
            if kp.private_key_file.is_empty() || kp.public_key_file.is_empty() {
                return Err(KeelError::InvalidConfig(
                    "both privateKeyFile and publicKeyFile must be set".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedEventWatcher {
    #[serde(default = "default_check_interval")]
    pub check_interval: Duration,
    #[serde(default)]
    pub git_repos: Vec<PipedEventWatcherGitRepo>,
}

impl Default for PipedEventWatcher {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_EVENT_WATCHER_CHECK_INTERVAL,
            git_repos: Vec::new(),
        }
    }
}

fn default_check_interval() -> Duration {
    DEFAULT_EVENT_WATCHER_CHECK_INTERVAL
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedEventWatcherGitRepo {
    pub repo_id: String,
    #[serde(default)]
    pub commit_message: String,
    /// File names under `.pipe/` to use; empty means all.
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl PipedEventWatcher {
    pub fn validate(&self) -> KeelResult {
        let mut seen = HashSet::new();
        for repo in &self.git_repos {
            if repo.repo_id.is_empty() {
                return Err(KeelError::InvalidConfig(
                    "missing repoID in the event watcher field".into(),
                ));
            }
            if !seen.insert(repo.repo_id.as_str()) {
                return Err(KeelError::InvalidConfig(format!(
                    "duplicated repo id ({}) found in the eventWatcher directive",
                    repo.repo_id
                )));
            }
        }
        Ok(())
    }

    pub fn git_repo(&self, repo_id: &str) -> Option<&PipedEventWatcherGitRepo> {
        self.git_repos.iter().find(|r| r.repo_id == repo_id)
    }
}

/// Environment overrides applied on top of the configuration file, read
/// from `KEEL_PIPED_*` variables.
#[derive(Debug, Default, Deserialize)]
struct PipedOverrides {
    api_address: Option<String>,
    piped_key_file: Option<String>,
    project_id: Option<String>,
    piped_id: Option<String>,
}

impl PipedSpec {
    pub fn from_yaml(data: &str) -> KeelResult<Self> {
        let envelope = Envelope::from_yaml(data)?;
        if envelope.kind != ConfigKind::Piped {
            return Err(KeelError::InvalidConfig(format!(
                "wrong configuration kind for piped: {:?}",
                envelope.kind
            )));
        }
        let mut spec: PipedSpec = envelope.spec()?;
        spec.apply_env_overrides()?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn load_file(path: &Path) -> KeelResult<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| KeelError::FileNotFound(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&data)
    }

    /// Loads from base64 encoded configuration data, as passed via `--config-data`.
    pub fn load_base64(data: &str) -> KeelResult<Self> {
        Self::from_yaml(&decode_base64(data, "config data")?)
    }

    fn apply_env_overrides(&mut self) -> KeelResult {
        let overrides: PipedOverrides = Config::builder()
            .add_source(Environment::with_prefix("KEEL_PIPED"))
            .build()?
            .try_deserialize()?;
        if let Some(v) = overrides.api_address {
            self.api_address = v;
        }
        if let Some(v) = overrides.piped_key_file {
            self.piped_key_file = v;
        }
        if let Some(v) = overrides.project_id {
            self.project_id = v;
        }
        if let Some(v) = overrides.piped_id {
            self.piped_id = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> KeelResult {
        if self.project_id.is_empty() {
            return Err(KeelError::InvalidConfig("projectID must be set".into()));
        }
        if self.piped_id.is_empty() {
            return Err(KeelError::InvalidConfig("pipedID must be set".into()));
        }
        if self.piped_key_file.is_empty() && self.piped_key_data.is_empty() {
            return Err(KeelError::InvalidConfig(
                "either pipedKeyFile or pipedKeyData must be set".into(),
            ));
        }
        if !self.piped_key_file.is_empty() && !self.piped_key_data.is_empty() {
            return Err(KeelError::InvalidConfig(
                "only pipedKeyFile or pipedKeyData can be set".into(),
            ));
        }
        if self.api_address.is_empty() {
            return Err(KeelError::InvalidConfig("apiAddress must be set".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(KeelError::InvalidConfig("syncInterval must be greater than 0".into()));
        }
        self.git.validate()?;
        let mut repo_ids = HashSet::new();
        for r in &self.repositories {
            if r.repo_id.is_empty() || r.remote.is_empty() {
                return Err(KeelError::InvalidConfig(
                    "repoId and remote must be set for every repository".into(),
                ));
            }
            if !repo_ids.insert(r.repo_id.as_str()) {
                return Err(KeelError::InvalidConfig(format!(
                    "duplicated repository id {}",
                    r.repo_id
                )));
            }
        }
        let mut names = HashSet::new();
        for p in &self.platform_providers {
            if !names.insert(p.name.as_str()) {
                return Err(KeelError::InvalidConfig(format!(
                    "duplicated platform provider name {}",
                    p.name
                )));
            }
        }
        if let Some(sm) = &self.secret_management {
            sm.validate()?;
        }
        self.event_watcher.validate()?;
        Ok(())
    }

    pub fn load_piped_key(&self) -> KeelResult<String> {
        let raw = if !self.piped_key_data.is_empty() {
            decode_base64(&self.piped_key_data, "piped key")?
        } else {
            fs::read_to_string(&self.piped_key_file)?
        };
        Ok(raw.trim().to_string())
    }

    pub fn repository(&self, repo_id: &str) -> Option<&PipedRepositoryConfig> {
        self.repositories.iter().find(|r| r.repo_id == repo_id)
    }

    pub fn platform_provider(&self, name: &str) -> Option<&PipedPlatformProviderConfig> {
        self.platform_providers.iter().find(|p| p.name == name)
    }

    pub fn secret_management_type(&self) -> SecretManagementType {
        self.secret_management
            .as_ref()
            .map(|s| s.r#type)
            .unwrap_or(SecretManagementType::None)
    }

    /// Whether an application with these labels is handled by this agent.
    pub fn matches_app_selector(&self, labels: &std::collections::HashMap<String, String>) -> bool {
        self.app_selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
    }
}

fn decode_base64(data: &str, what: &str) -> KeelResult<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| KeelError::InvalidConfig(format!("failed to decode {}: {}", what, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| KeelError::InvalidConfig(format!("{} is not valid utf-8: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPED: &str = r#"
apiVersion: keel.dev/v1beta1
kind: Piped
spec:
  projectID: test-project
  pipedID: test-piped
  pipedKeyFile: etc/piped/key
  apiAddress: your-keel.domain
  git:
    username: username
    email: username@email.com
    sshKeyFile: /etc/piped-secret/ssh-key
  repositories:
    - repoId: repo1
      remote: git@github.com:org/repo1.git
      branch: master
  platformProviders:
    - name: kubernetes-default
      type: KUBERNETES
      config:
        appStateInformer:
          includeResources:
            - apiVersion: keel.dev/v1beta1
    - name: terraform
      type: TERRAFORM
  secretManagement:
    type: KEY_PAIR
    keyPair:
      privateKeyFile: /etc/piped-secret/pair-private-key
      publicKeyFile: /etc/piped-secret/pair-public-key
  eventWatcher:
    checkInterval: 10m
    gitRepos:
      - repoId: repo1
        commitMessage: Update values by Event watcher
        includes:
          - event-watcher-dev.yaml
"#;

    #[test]
    fn parses_piped_config() {
        let spec = PipedSpec::from_yaml(PIPED).unwrap();
        assert_eq!(spec.project_id, "test-project");
        assert_eq!(spec.piped_id, "test-piped");
        assert_eq!(spec.sync_interval, Duration::from_secs(60));
        assert_eq!(spec.git.username(), "username");
        assert_eq!(spec.repository("repo1").unwrap().branch, "master");
        assert_eq!(spec.platform_providers[1].r#type, ApplicationKind::Terraform);
        let k8s = spec.platform_provider("kubernetes-default").unwrap().kubernetes().unwrap();
        assert_eq!(k8s.app_state_informer.include_resources.len(), 1);
        assert_eq!(spec.secret_management_type(), SecretManagementType::KeyPair);
        assert_eq!(spec.event_watcher.check_interval, Duration::from_secs(600));
        assert_eq!(spec.event_watcher.git_repo("repo1").unwrap().includes.len(), 1);
    }

    #[test]
    fn loads_base64_data() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(PIPED);
        let spec = PipedSpec::load_base64(&encoded).unwrap();
        assert_eq!(spec.piped_id, "test-piped");
        assert!(PipedSpec::load_base64("!!!").is_err());
    }

    #[test]
    fn git_defaults() {
        let git = PipedGit::default();
        assert_eq!(git.username(), "piped");
        assert_eq!(git.email(), "keel@localhost");
        assert!(!git.should_configure_ssh_config());
    }

    #[test]
    fn event_watcher_repos_must_be_unique() {
        let mut ew = PipedEventWatcher::default();
        ew.git_repos.push(PipedEventWatcherGitRepo {
            repo_id: "foo".into(),
            ..Default::default()
        });
        assert!(ew.validate().is_ok());
        ew.git_repos.push(PipedEventWatcherGitRepo {
            repo_id: "foo".into(),
            ..Default::default()
        });
        assert!(ew.validate().is_err());
        ew.git_repos = vec![PipedEventWatcherGitRepo::default()];
        assert!(ew.validate().is_err());
    }

    #[test]
    fn rejects_missing_identity() {
        let cfg = "kind: Piped\nspec:\n  projectID: p\n  pipedID: ''\n  pipedKeyData: a2V5\n  apiAddress: x\n";
        assert!(PipedSpec::from_yaml(cfg).is_err());
        let cfg = "kind: Piped\nspec:\n  projectID: p\n  pipedID: q\n  apiAddress: x\n";
        assert!(PipedSpec::from_yaml(cfg).is_err());
    }

    #[test]
    fn reads_key_data() {
        let cfg = "kind: Piped\nspec:\n  projectID: p\n  pipedID: q\n  pipedKeyData: a2V5Cg==\n  apiAddress: x\n";
        let spec = PipedSpec::from_yaml(cfg).unwrap();
        assert_eq!(spec.load_piped_key().unwrap(), "key");
    }

    #[test]
    fn app_selector_requires_all_labels() {
        let mut spec = PipedSpec::from_yaml(PIPED).unwrap();
        spec.app_selector.insert("env".into(), "dev".into());
        let mut labels = std::collections::HashMap::new();
        assert!(!spec.matches_app_selector(&labels));
        labels.insert("env".into(), "dev".into());
        assert!(spec.matches_app_selector(&labels));
    }
}
