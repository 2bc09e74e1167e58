//! Deployment and stage metadata shared between stages of one deployment.
//!
//! Values are merged locally first so later stages of the same scheduler see
//! them without a round trip, then saved on the control plane.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use dashmap::DashMap;
use keel_common::{
    model::Deployment,
    rpc::{PipedService, SaveDeploymentMetadataRequest, SaveStageMetadataRequest},
};

use crate::{
    apiclient::{rpc_retry, with_retry},
    error::KeelPipedResult,
};

pub struct MetadataStore {
    client: Arc<dyn PipedService>,
    deployment_id: String,
    shared: RwLock<HashMap<String, String>>,
    stages: DashMap<String, HashMap<String, String>>,
}

impl MetadataStore {
    pub fn new(client: Arc<dyn PipedService>, deployment: &Deployment) -> Self {
        let stages = deployment
            .stages
            .iter()
            .map(|s| (s.id.clone(), s.metadata.clone()))
            .collect();
        Self {
            client,
            deployment_id: deployment.id.clone(),
            shared: RwLock::new(deployment.metadata.clone()),
            stages,
        }
    }

    pub fn shared(&self) -> SharedMetadata<'_> {
        SharedMetadata { store: self }
    }

    pub fn stage<'a>(&'a self, stage_id: &'a str) -> StageMetadata<'a> {
        StageMetadata {
            store: self,
            stage_id,
        }
    }
}

/// Deployment wide metadata.
pub struct SharedMetadata<'a> {
    store: &'a MetadataStore,
}

impl SharedMetadata<'_> {
    pub fn get(&self, key: &str) -> Option<String> {
        self.store
            .shared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub async fn put(&self, key: &str, value: &str) -> KeelPipedResult {
        self.put_multi(HashMap::from([(key.to_string(), value.to_string())]))
            .await
    }

    pub async fn put_multi(&self, metadata: HashMap<String, String>) -> KeelPipedResult {
        self.store
            .shared
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(metadata.clone());
        let req = SaveDeploymentMetadataRequest {
            deployment_id: self.store.deployment_id.clone(),
            metadata,
        };
        with_retry(&rpc_retry(), |_| {
            self.store.client.save_deployment_metadata(req.clone())
        })
        .await?;
        Ok(())
    }
}

/// Metadata of a single stage.
pub struct StageMetadata<'a> {
    store: &'a MetadataStore,
    stage_id: &'a str,
}

impl StageMetadata<'_> {
    pub fn get(&self, key: &str) -> Option<String> {
        self.store
            .stages
            .get(self.stage_id)
            .and_then(|m| m.get(key).cloned())
    }

    pub async fn put(&self, key: &str, value: &str) -> KeelPipedResult {
        self.put_multi(HashMap::from([(key.to_string(), value.to_string())]))
            .await
    }

    pub async fn put_multi(&self, metadata: HashMap<String, String>) -> KeelPipedResult {
        self.store
            .stages
            .entry(self.stage_id.to_string())
            .or_default()
            .extend(metadata.clone());
        let req = SaveStageMetadataRequest {
            deployment_id: self.store.deployment_id.clone(),
            stage_id: self.stage_id.to_string(),
            metadata,
        };
        with_retry(&rpc_retry(), |_| {
            self.store.client.save_stage_metadata(req.clone())
        })
        .await?;
        Ok(())
    }
}
