//! Watches the resources labelled with an application id in one cluster.
use std::{collections::HashSet, pin::pin, sync::Arc};

use futures::StreamExt;
use keel_common::{
    config::{KubernetesProviderConfig, KubernetesResourceMatcher},
    model::{HealthStatus, ResourceState},
    time::{now_unix, parse_rfc3339},
};
use kube::{
    api::DynamicObject,
    core::GroupVersionKind,
    discovery::{pinned_kind, Scope},
    runtime::{watcher, WatchStreamExt},
    Api, Client,
};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::MemoryStore;
use crate::{
    error::KeelPipedResult,
    kubernetes::{kube_client, Manifest, LABEL_APPLICATION},
};

const DEFAULT_WATCHED_KINDS: [(&str, &str); 13] = [
    ("apps/v1", "Deployment"),
    ("apps/v1", "ReplicaSet"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("v1", "Pod"),
    ("v1", "Service"),
    ("v1", "ConfigMap"),
    ("v1", "Secret"),
    ("v1", "ServiceAccount"),
    ("networking.k8s.io/v1", "Ingress"),
    ("batch/v1", "Job"),
    ("batch/v1", "CronJob"),
    ("autoscaling/v2", "HorizontalPodAutoscaler"),
];

/// Feeds a [`MemoryStore`] from cluster watches.
pub struct KubernetesStore {
    provider: String,
    cfg: KubernetesProviderConfig,
    store: Arc<MemoryStore>,
}

impl KubernetesStore {
    pub fn new(provider: &str, cfg: KubernetesProviderConfig, store: Arc<MemoryStore>) -> Self {
        Self {
            provider: provider.to_string(),
            cfg,
            store,
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        let client = kube_client(&self.cfg).await?;
        let mut watches = JoinSet::new();
        for (api_version, kind) in watched_kinds(&self.cfg) {
            let api = match self.api_for(&client, &api_version, &kind).await {
                Ok(api) => api,
                Err(e) => {
                    warn!(provider = %self.provider, %api_version, %kind, "unable to watch resources: {}", e);
                    continue;
                }
            };
            let store = self.store.clone();
            let token = token.clone();
            watches.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = watch(api, &api_version, &kind, &store) => {}
                }
            });
        }
        info!(provider = %self.provider, kinds = watches.len(), "kubernetes live state store has been started");
        while watches.join_next().await.is_some() {}
        info!(provider = %self.provider, "kubernetes live state store has been stopped");
        Ok(())
    }

    async fn api_for(
        &self,
        client: &Client,
        api_version: &str,
        kind: &str,
    ) -> KeelPipedResult<Api<DynamicObject>> {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = pinned_kind(client, &gvk).await?;
        Ok(match caps.scope {
            Scope::Namespaced if !self.cfg.namespace.is_empty() => {
                Api::namespaced_with(client.clone(), &self.cfg.namespace, &resource)
            }
            _ => Api::all_with(client.clone(), &resource),
        })
    }
}

/// The api versions and kinds watched for a provider.
pub fn watched_kinds(cfg: &KubernetesProviderConfig) -> Vec<(String, String)> {
    let informer = &cfg.app_state_informer;
    let mut kinds: Vec<(String, String)> = DEFAULT_WATCHED_KINDS
        .iter()
        .map(|(v, k)| (v.to_string(), k.to_string()))
        .collect();
    for m in &informer.include_resources {
        if !m.kind.is_empty() && !kinds.iter().any(|(v, k)| *v == m.api_version && *k == m.kind) {
            kinds.push((m.api_version.clone(), m.kind.clone()));
        }
    }
    kinds.retain(|(v, k)| !informer.exclude_resources.iter().any(|m| excludes(m, v, k)));
    kinds
}

// An exclude without kind covers the whole api version.
fn excludes(m: &KubernetesResourceMatcher, api_version: &str, kind: &str) -> bool {
    m.api_version == api_version && (m.kind.is_empty() || m.kind == kind)
}

async fn watch(api: Api<DynamicObject>, api_version: &str, kind: &str, store: &MemoryStore) {
    let config = watcher::Config::default().labels(LABEL_APPLICATION);
    let mut stream = pin!(watcher(api, config).default_backoff());
    let mut listed = HashSet::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => listed.clear(),
            Ok(watcher::Event::InitApply(obj)) => {
                if let Some(id) = apply(store, api_version, kind, obj) {
                    listed.insert(id);
                }
            }
            Ok(watcher::Event::InitDone) => store.retain_kind(api_version, kind, &listed),
            Ok(watcher::Event::Apply(obj)) => {
                apply(store, api_version, kind, obj);
            }
            Ok(watcher::Event::Delete(obj)) => {
                if let (Some(app_id), Some(uid)) = (application_id(&obj), obj.metadata.uid.as_deref()) {
                    store.delete(&app_id, uid);
                }
            }
            Err(e) => warn!(api_version, kind, "resource watch failed: {}", e),
        }
    }
}

fn application_id(obj: &DynamicObject) -> Option<String> {
    obj.metadata
        .labels
        .as_ref()?
        .get(LABEL_APPLICATION)
        .filter(|id| !id.is_empty())
        .cloned()
}

fn apply(store: &MemoryStore, api_version: &str, kind: &str, obj: DynamicObject) -> Option<String> {
    let app_id = application_id(&obj)?;
    let mut body = match serde_json::to_value(&obj) {
        Ok(body) => body,
        Err(e) => {
            warn!(api_version, kind, "unable to encode live resource: {}", e);
            return None;
        }
    };
    // List items may come without type information.
    body["apiVersion"] = Value::from(api_version);
    body["kind"] = Value::from(kind);
    if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
    }
    let state = resource_state(api_version, kind, &body)?;
    let id = state.id.clone();
    store.upsert(&app_id, state, Manifest::from_body(body).ok());
    Some(id)
}

fn resource_state(api_version: &str, kind: &str, body: &Value) -> Option<ResourceState> {
    let metadata = body.get("metadata")?;
    let str_of = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let id = str_of(metadata, "uid");
    if id.is_empty() {
        return None;
    }
    let owner_ids: Vec<String> = metadata
        .get("ownerReferences")
        .and_then(Value::as_array)
        .map(|owners| owners.iter().map(|o| str_of(o, "uid")).filter(|u| !u.is_empty()).collect())
        .unwrap_or_default();
    let created_at = metadata
        .get("creationTimestamp")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339)
        .unwrap_or_default();
    let (health_status, health_description) = determine_health(kind, body);
    Some(ResourceState {
        id,
        parent_ids: owner_ids.clone(),
        owner_ids,
        name: str_of(metadata, "name"),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        namespace: str_of(metadata, "namespace"),
        health_status,
        health_description,
        created_at,
        updated_at: now_unix(),
    })
}

fn int_at(body: &Value, path: &[&str]) -> Option<i64> {
    path.iter()
        .try_fold(body, |v, key| v.get(key))
        .and_then(Value::as_i64)
}

/// Health of a resource from its status. Kinds without a status model are
/// healthy once they exist.
pub fn determine_health(kind: &str, body: &Value) -> (HealthStatus, String) {
    let desired = int_at(body, &["spec", "replicas"]).unwrap_or(1);
    let replicas_health = |ready_field: &str| {
        let ready = int_at(body, &["status", ready_field]).unwrap_or(0);
        if ready >= desired {
            (HealthStatus::Healthy, String::new())
        } else {
            (
                HealthStatus::Unhealthy,
                format!("{} of {} replicas are ready", ready, desired),
            )
        }
    };
    match kind {
        "Deployment" => replicas_health("availableReplicas"),
        "StatefulSet" | "ReplicaSet" => replicas_health("readyReplicas"),
        "DaemonSet" => {
            let desired = int_at(body, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let available = int_at(body, &["status", "numberAvailable"]).unwrap_or(0);
            if available >= desired {
                (HealthStatus::Healthy, String::new())
            } else {
                (
                    HealthStatus::Unhealthy,
                    format!("{} of {} pods are available", available, desired),
                )
            }
        }
        "Pod" => {
            let phase = body
                .pointer("/status/phase")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            match phase {
                "Running" | "Succeeded" => (HealthStatus::Healthy, String::new()),
                other => (HealthStatus::Unhealthy, format!("pod is {}", other)),
            }
        }
        "Job" => match int_at(body, &["status", "failed"]) {
            Some(failed) if failed > 0 => (
                HealthStatus::Unhealthy,
                format!("{} pods of the job failed", failed),
            ),
            _ => (HealthStatus::Healthy, String::new()),
        },
        _ => (HealthStatus::Healthy, String::new()),
    }
}
