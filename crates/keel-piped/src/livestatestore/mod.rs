//! Live state of the resources deployed by this piped, per platform provider.
//!
//! Every provider keeps a [`MemoryStore`]: the current resources of each
//! application plus a bounded log of resource change events. Kubernetes
//! providers feed theirs from cluster watches; other kinds are fed by
//! whoever knows the resource state.
pub mod kubernetes;

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, RwLock},
};

use keel_common::{
    model::{
        ApplicationLiveStateSnapshot, LiveStateVersion, ResourceEventType, ResourceState,
        ResourceStateEvent,
    },
    time::now_unix,
};

use crate::kubernetes::Manifest;

pub use self::kubernetes::KubernetesStore;

/// Events kept for iterators that fall behind.
const MAX_BUFFERED_EVENTS: usize = 10_000;

struct Entry {
    state: ResourceState,
    manifest: Option<Manifest>,
}

#[derive(Default)]
struct Inner {
    apps: HashMap<String, BTreeMap<String, Entry>>,
    versions: HashMap<String, LiveStateVersion>,
    events: VecDeque<ResourceStateEvent>,
    // Offset of `events[0]` in the whole event log.
    first_offset: u64,
    index: i64,
}

impl Inner {
    fn next_version(&mut self, app_id: &str) -> LiveStateVersion {
        self.index += 1;
        let version = LiveStateVersion {
            timestamp: now_unix(),
            index: self.index,
        };
        self.versions.insert(app_id.to_string(), version);
        version
    }

    fn record(&mut self, app_id: &str, r#type: ResourceEventType, state: ResourceState) {
        let version = self.next_version(app_id);
        self.events.push_back(ResourceStateEvent {
            id: uuid::Uuid::new_v4().to_string(),
            application_id: app_id.to_string(),
            piped_id: String::new(),
            project_id: String::new(),
            r#type,
            state,
            snapshot_version: version,
            created_at: version.timestamp,
        });
        while self.events.len() > MAX_BUFFERED_EVENTS {
            self.events.pop_front();
            self.first_offset += 1;
        }
    }
}

/// Resources by application with a change log.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a resource of `app_id`.
    pub fn upsert(&self, app_id: &str, state: ResourceState, manifest: Option<Manifest>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let resources = inner.apps.entry(app_id.to_string()).or_default();
        let r#type = match resources.get(&state.id) {
            None => ResourceEventType::Added,
            Some(old) if old.state == state && old.manifest == manifest => return,
            Some(_) => ResourceEventType::Updated,
        };
        resources.insert(
            state.id.clone(),
            Entry {
                state: state.clone(),
                manifest,
            },
        );
        inner.record(app_id, r#type, state);
    }

    pub fn delete(&self, app_id: &str, resource_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(removed) = inner
            .apps
            .get_mut(app_id)
            .and_then(|resources| resources.remove(resource_id))
        else {
            return;
        };
        if inner.apps.get(app_id).is_some_and(BTreeMap::is_empty) {
            inner.apps.remove(app_id);
        }
        inner.record(app_id, ResourceEventType::Deleted, removed.state);
    }

    /// Deletes the resources of the given api version and kind not in `keep`.
    pub fn retain_kind(&self, api_version: &str, kind: &str, keep: &HashSet<String>) {
        let stale: Vec<(String, String)> = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner
                .apps
                .iter()
                .flat_map(|(app_id, resources)| {
                    resources
                        .values()
                        .filter(|e| {
                            e.state.api_version == api_version
                                && e.state.kind == kind
                                && !keep.contains(&e.state.id)
                        })
                        .map(move |e| (app_id.clone(), e.state.id.clone()))
                })
                .collect()
        };
        for (app_id, id) in stale {
            self.delete(&app_id, &id);
        }
    }

    pub fn application_ids(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = inner.apps.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current resources of `app_id` and the version they were read at.
    /// Only the resources part is filled in.
    pub fn snapshot(&self, app_id: &str) -> ApplicationLiveStateSnapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        ApplicationLiveStateSnapshot {
            application_id: app_id.to_string(),
            resources: inner
                .apps
                .get(app_id)
                .map(|r| r.values().map(|e| e.state.clone()).collect())
                .unwrap_or_default(),
            version: inner.versions.get(app_id).copied().unwrap_or_default(),
            ..Default::default()
        }
    }

    /// Live manifests of the resources not owned by another resource.
    pub fn manifests(&self, app_id: &str) -> Vec<Manifest> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .apps
            .get(app_id)
            .map(|resources| {
                resources
                    .values()
                    .filter(|e| e.state.owner_ids.is_empty())
                    .filter_map(|e| e.manifest.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// An iterator starting after the events recorded so far.
    pub fn event_iterator(self: &Arc<Self>) -> EventIterator {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        EventIterator {
            store: self.clone(),
            offset: inner.first_offset + inner.events.len() as u64,
        }
    }

    fn events_from(&self, offset: u64, max: usize) -> (Vec<ResourceStateEvent>, u64) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        // Events dropped from the buffer are skipped.
        let start = offset.max(inner.first_offset);
        let skip = (start - inner.first_offset) as usize;
        let events: Vec<ResourceStateEvent> =
            inner.events.iter().skip(skip).take(max).cloned().collect();
        let next = start + events.len() as u64;
        (events, next)
    }
}

/// Reads the change log of a store from a position of its own.
pub struct EventIterator {
    store: Arc<MemoryStore>,
    offset: u64,
}

impl EventIterator {
    /// Returns at most `max` events recorded since the previous call.
    pub fn next(&mut self, max: usize) -> Vec<ResourceStateEvent> {
        let (events, next) = self.store.events_from(self.offset, max);
        self.offset = next;
        events
    }
}

/// Live state stores by platform provider name.
#[derive(Default, Clone)]
pub struct Registry {
    stores: HashMap<String, Arc<MemoryStore>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: &str, store: Arc<MemoryStore>) {
        self.stores.insert(provider.to_string(), store);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<MemoryStore>> {
        self.stores.get(provider).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<MemoryStore>)> {
        self.stores.iter()
    }
}

#[cfg(test)]
pub(crate) fn resource(id: &str, kind: &str, owners: &[&str]) -> ResourceState {
    ResourceState {
        id: id.to_string(),
        owner_ids: owners.iter().map(|s| s.to_string()).collect(),
        parent_ids: owners.iter().map(|s| s.to_string()).collect(),
        name: id.to_string(),
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        namespace: "default".to_string(),
        health_status: keel_common::model::HealthStatus::Healthy,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_are_logged_once() {
        let store = Arc::new(MemoryStore::new());
        let mut it = store.event_iterator();

        store.upsert("a1", resource("d", "Deployment", &[]), None);
        store.upsert("a1", resource("d", "Deployment", &[]), None);
        let mut rs = resource("rs", "ReplicaSet", &["d"]);
        store.upsert("a1", rs.clone(), None);
        rs.health_status = keel_common::model::HealthStatus::Unhealthy;
        store.upsert("a1", rs, None);
        store.delete("a1", "rs");
        store.delete("a1", "missing");

        let events = it.next(100);
        let types: Vec<ResourceEventType> = events.iter().map(|e| e.r#type).collect();
        assert_eq!(
            types,
            vec![
                ResourceEventType::Added,
                ResourceEventType::Added,
                ResourceEventType::Updated,
                ResourceEventType::Deleted,
            ]
        );
        assert!(events
            .windows(2)
            .all(|w| w[0].snapshot_version.is_before(&w[1].snapshot_version)));
        assert!(it.next(100).is_empty());

        let snapshot = store.snapshot("a1");
        assert_eq!(snapshot.resources.len(), 1);
        assert_eq!(snapshot.version, events[3].snapshot_version);
    }

    #[test]
    fn iterator_pages_through_events() {
        let store = Arc::new(MemoryStore::new());
        let mut it = store.event_iterator();
        for i in 0..5 {
            store.upsert("a1", resource(&format!("r{i}"), "Pod", &[]), None);
        }
        assert_eq!(it.next(3).len(), 3);
        assert_eq!(it.next(3).len(), 2);
        assert!(it.next(3).is_empty());
    }

    #[test]
    fn retain_kind_deletes_unseen_resources() {
        let store = MemoryStore::new();
        store.upsert("a1", resource("d1", "Deployment", &[]), None);
        store.upsert("a2", resource("d2", "Deployment", &[]), None);
        store.upsert("a2", resource("p1", "Pod", &[]), None);
        store.retain_kind("apps/v1", "Deployment", &HashSet::from(["d2".to_string()]));
        assert_eq!(store.application_ids(), vec!["a2".to_string()]);
        assert_eq!(store.snapshot("a2").resources.len(), 2);
    }
}
