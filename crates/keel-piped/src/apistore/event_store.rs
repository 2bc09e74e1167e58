use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use keel_common::{
    model::{make_event_key, Event, EventStatus},
    rpc::{ListEventsRequest, ListOrder, PipedService},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::poll;
use crate::{
    apiclient::{rpc_retry, with_retry},
    error::KeelPipedResult,
};

const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Not handled events of the project.
///
/// Every refresh only asks for events created since the newest one already
/// seen, so the cache grows incrementally.
pub struct EventStore {
    client: Arc<dyn PipedService>,
    events: DashMap<String, Event>,
    handled: DashSet<String>,
    milestone: AtomicI64,
}

impl EventStore {
    pub fn new(client: Arc<dyn PipedService>) -> Self {
        Self {
            client,
            events: DashMap::new(),
            handled: DashSet::new(),
            milestone: AtomicI64::new(0),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        poll("event", SYNC_INTERVAL, token, || self.sync()).await
    }

    pub async fn sync(&self) -> KeelPipedResult {
        let req = ListEventsRequest {
            from: self.milestone.load(Ordering::SeqCst),
            to: 0,
            order: ListOrder::Asc,
            status: Some(EventStatus::NotHandled),
        };
        let resp = with_retry(&rpc_retry(), |_| self.client.list_events(req.clone())).await?;
        let mut newest = self.milestone.load(Ordering::SeqCst);
        for event in resp.events {
            newest = newest.max(event.created_at);
            if self.handled.contains(&event.id) {
                continue;
            }
            self.events.insert(event.id.clone(), event);
        }
        self.milestone.store(newest, Ordering::SeqCst);
        debug!(count = self.events.len(), "refreshed events");
        Ok(())
    }

    /// Not handled events carrying exactly `name` and `labels`, created at or
    /// after `since`. At most `limit` of the newest are returned, oldest first.
    pub fn list_not_handled(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
        since: i64,
        limit: usize,
    ) -> Vec<Event> {
        let key = make_event_key(name, labels);
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|e| {
                e.status == EventStatus::NotHandled
                    && e.name == name
                    && e.event_key == key
                    && e.created_at >= since
            })
            .map(|e| e.value().clone())
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        events
    }

    /// Drops events whose status has been reported.
    pub fn mark_handled<S: AsRef<str>>(&self, ids: &[S]) {
        for id in ids {
            self.events.remove(id.as_ref());
            self.handled.insert(id.as_ref().to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{event, ControlPlane};

    #[tokio::test]
    async fn lists_the_newest_matching_events() {
        let cp = ControlPlane::new().await;
        for (id, env, at) in [("e1", "dev", 10), ("e2", "dev", 20), ("e3", "prod", 30), ("e4", "dev", 40)] {
            cp.stores().events.add(&event(id, "image-tag", env, at)).await.unwrap();
        }
        let store = EventStore::new(cp.client());
        store.sync().await.unwrap();
        assert_eq!(store.len(), 4);

        let labels = HashMap::from([("env".to_string(), "dev".to_string())]);
        let ids: Vec<String> = store
            .list_not_handled("image-tag", &labels, 0, 2)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["e2".to_string(), "e4".to_string()]);
        assert_eq!(store.list_not_handled("image-tag", &labels, 25, 10).len(), 1);
        assert!(store.list_not_handled("image-tag", &HashMap::new(), 0, 10).is_empty());

        store.mark_handled(&["e4"]);
        store.sync().await.unwrap();
        let ids: Vec<String> = store
            .list_not_handled("image-tag", &labels, 0, 10)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["e1".to_string(), "e2".to_string()]);
    }
}
