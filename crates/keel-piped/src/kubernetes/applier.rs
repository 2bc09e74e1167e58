use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use keel_common::config::KubernetesProviderConfig;
use kube::{
    api::{DeleteParams, DynamicObject, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    discovery::{pinned_kind, Scope},
    Api, Client, Config,
};
use tracing::{debug, info};

use super::manifest::{Manifest, ResourceKey};
use crate::error::{KeelPipedError, KeelPipedResult};

const FIELD_MANAGER: &str = "keel-piped";

/// Writes resources to a cluster.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, manifest: &Manifest) -> KeelPipedResult;

    /// Deleting a missing resource is not an error.
    async fn delete(&self, key: &ResourceKey) -> KeelPipedResult;
}

/// Appliers by platform provider name.
#[derive(Default)]
pub struct ApplierRegistry {
    appliers: DashMap<String, Arc<dyn Applier>>,
}

impl ApplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: &str, applier: Arc<dyn Applier>) {
        self.appliers.insert(provider.to_string(), applier);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Applier>> {
        self.appliers.get(provider).map(|a| a.value().clone())
    }
}

/// Server side apply through the Kubernetes API.
pub struct KubeApplier {
    client: Client,
    default_namespace: String,
}

impl KubeApplier {
    pub fn new(client: Client, default_namespace: &str) -> Self {
        Self {
            client,
            default_namespace: default_namespace.to_string(),
        }
    }

    pub async fn from_config(cfg: &KubernetesProviderConfig) -> KeelPipedResult<Self> {
        let client = kube_client(cfg).await?;
        let namespace = if cfg.namespace.is_empty() {
            client.default_namespace().to_string()
        } else {
            cfg.namespace.clone()
        };
        Ok(Self::new(client, &namespace))
    }

    async fn api_for(&self, key: &ResourceKey) -> KeelPipedResult<(Api<DynamicObject>, String)> {
        let (group, version) = key.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &key.kind);
        let (resource, caps) = pinned_kind(&self.client, &gvk).await?;
        let namespace = if key.namespace.is_empty() {
            self.default_namespace.clone()
        } else {
            key.namespace.clone()
        };
        let api = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), &namespace, &resource),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };
        Ok((api, namespace))
    }
}

#[async_trait]
impl Applier for KubeApplier {
    async fn apply(&self, manifest: &Manifest) -> KeelPipedResult {
        let (api, namespace) = self.api_for(&manifest.key).await?;
        let mut object: DynamicObject = serde_json::from_value(manifest.body.clone())?;
        if object.metadata.namespace.is_none() {
            object.metadata.namespace = Some(namespace);
        }
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&manifest.key.name, &params, &Patch::Apply(&object))
            .await?;
        info!(resource = %manifest.key, "applied resource");
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> KeelPipedResult {
        let (api, _) = self.api_for(key).await?;
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(resource = %key, "deleted resource");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(resource = %key, "resource was already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds a client from the provider's kubeconfig, or the in-cluster /
/// default configuration.
pub async fn kube_client(cfg: &KubernetesProviderConfig) -> KeelPipedResult<Client> {
    let config = if cfg.kubeconfig_path.is_empty() {
        Config::infer()
            .await
            .map_err(|e| KeelPipedError::runtime(format!("unable to infer kubeconfig: {}", e)))?
    } else {
        let kubeconfig = Kubeconfig::read_from(&cfg.kubeconfig_path)
            .map_err(|e| KeelPipedError::InvalidConfig(format!("invalid kubeconfig: {}", e)))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| KeelPipedError::InvalidConfig(format!("invalid kubeconfig: {}", e)))?
    };
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Records what would have been written to a cluster.
    #[derive(Default)]
    pub struct FakeApplier {
        pub applied: Mutex<Vec<Manifest>>,
        pub deleted: Mutex<Vec<ResourceKey>>,
        /// Resources whose apply fails.
        pub failing: Mutex<Vec<String>>,
    }

    impl FakeApplier {
        pub fn applied_names(&self) -> Vec<String> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.key.name.clone())
                .collect()
        }

        pub fn fail_on(&self, name: &str) {
            self.failing.lock().unwrap().push(name.to_string());
        }
    }

    #[async_trait]
    impl Applier for FakeApplier {
        async fn apply(&self, manifest: &Manifest) -> KeelPipedResult {
            if self.failing.lock().unwrap().contains(&manifest.key.name) {
                return Err(KeelPipedError::runtime(format!(
                    "admission webhook denied {}",
                    manifest.key
                )));
            }
            self.applied.lock().unwrap().push(manifest.clone());
            Ok(())
        }

        async fn delete(&self, key: &ResourceKey) -> KeelPipedResult {
            self.deleted.lock().unwrap().push(key.clone());
            Ok(())
        }
    }
}
