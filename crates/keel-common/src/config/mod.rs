//! Configuration files stored in Git (application and event watcher
//! configs) and the agent configuration file.
use serde::{Deserialize, Serialize};

use crate::error::{KeelError, KeelResult};

pub mod application;
pub mod duration;
pub mod event_watcher;
pub mod piped;

pub use application::*;
pub use duration::Duration;
pub use event_watcher::*;
pub use piped::*;

pub const API_VERSION: &str = "keel.dev/v1beta1";

/// Directory at the root of a repository holding repository-wide configs.
pub const SHARED_CONFIGURATION_DIR_NAME: &str = ".pipe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKind {
    KubernetesApp,
    TerraformApp,
    CloudRunApp,
    LambdaApp,
    #[serde(rename = "ECSApp")]
    EcsApp,
    CrossplaneApp,
    Piped,
    EventWatcher,
}

/// Every configuration file shares this envelope; `spec` depends on `kind`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub api_version: String,
    pub kind: ConfigKind,
    #[serde(default)]
    pub spec: serde_yaml::Value,
}

impl Envelope {
    pub fn from_yaml(data: &str) -> KeelResult<Self> {
        let envelope: Envelope = serde_yaml::from_str(data)?;
        if !envelope.api_version.is_empty() && envelope.api_version != API_VERSION {
            return Err(KeelError::InvalidConfig(format!(
                "unsupported apiVersion {:?}, expected {}",
                envelope.api_version, API_VERSION
            )));
        }
        Ok(envelope)
    }

    /// Deserializes the spec, treating a missing spec as an empty mapping.
    pub fn spec<T: serde::de::DeserializeOwned>(&self) -> KeelResult<T> {
        let value = match &self.spec {
            serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
            v => v.clone(),
        };
        Ok(serde_yaml::from_value(value)?)
    }
}
