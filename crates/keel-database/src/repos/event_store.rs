use std::{collections::HashMap, sync::Arc};

use keel_common::{
    model::{make_event_key, Event, EventStatus},
    time::now_unix,
};
use serde_json::json;

use super::Collection;
use crate::{
    datastore::{DataStore, Direction, Filter, Kind, ListOptions, Operator},
    error::{KeelDatabaseError, KeelDatabaseResult},
};

/// Query of [`EventStore::list`]; `to == 0` leaves the range open ended.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub from: i64,
    pub to: i64,
    pub descending: bool,
    pub status: Option<EventStatus>,
    pub limit: usize,
}

#[derive(Clone)]
pub struct EventStore {
    collection: Collection<Event>,
}

impl EventStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            collection: Collection::new(ds, Kind::Event),
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<Event> {
        self.collection.get(id).await
    }

    /// Stores a new event, deriving its key from the name and labels.
    pub async fn add(&self, event: &Event) -> KeelDatabaseResult<Event> {
        if event.id.is_empty() || event.name.is_empty() || event.project_id.is_empty() {
            return Err(KeelDatabaseError::InvalidArgument(
                "event id, name and project id are required".into(),
            ));
        }
        let mut e = event.clone();
        e.event_key = make_event_key(&e.name, &e.labels);
        let now = now_unix();
        if e.created_at == 0 {
            e.created_at = now;
        }
        e.updated_at = now;
        self.collection.create(&e.id, &e).await?;
        Ok(e)
    }

    /// The newest event carrying exactly this name and label set.
    pub async fn get_latest(
        &self,
        project_id: &str,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> KeelDatabaseResult<Event> {
        let opts = ListOptions::new()
            .eq("project_id", project_id)
            .eq("name", name)
            .eq("event_key", make_event_key(name, labels))
            .order("created_at", Direction::Desc)
            .limit(1);
        self.collection
            .list(&opts)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KeelDatabaseError::NotFound("no events found".into()))
    }

    pub async fn list(&self, project_id: &str, query: &EventQuery) -> KeelDatabaseResult<Vec<Event>> {
        let mut opts = ListOptions::new()
            .eq("project_id", project_id)
            .filter(Filter::new("created_at", Operator::Gte, query.from));
        if query.to > 0 {
            opts = opts.filter(Filter::new("created_at", Operator::Lt, query.to));
        }
        if let Some(status) = query.status {
            opts = opts.eq("status", json!(status));
        }
        let direction = if query.descending {
            Direction::Desc
        } else {
            Direction::Asc
        };
        let opts = opts.order("created_at", direction).limit(query.limit);
        self.collection.list(&opts).await
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        description: &str,
    ) -> KeelDatabaseResult<Event> {
        if !status.is_handled() {
            return Err(KeelDatabaseError::InvalidArgument(format!(
                "event {} cannot be reported as not handled",
                id
            )));
        }
        self.collection
            .update(id, |e| {
                if e.status == status && e.status_description == description {
                    return Ok(false);
                }
                let now = now_unix();
                e.status = status;
                e.status_description = description.to_string();
                e.handled_at = now;
                e.updated_at = now;
                Ok(true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::testing::stores;

    fn event(id: &str, name: &str, labels: &[(&str, &str)], created_at: i64) -> Event {
        Event {
            id: id.to_string(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            data: format!("v-{}", id),
            project_id: "proj".to_string(),
            created_at,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn latest_event_matches_exact_label_set() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        s.events.add(&event("1", "image", &[("env", "dev")], 10)).await.unwrap();
        s.events.add(&event("2", "image", &[("env", "dev")], 30)).await.unwrap();
        s.events.add(&event("3", "image", &[("env", "prd")], 50)).await.unwrap();
        s.events.add(&event("4", "image", &[], 60)).await.unwrap();

        let labels = HashMap::from([("env".to_string(), "dev".to_string())]);
        let latest = s.events.get_latest("proj", "image", &labels).await.unwrap();
        assert_eq!(latest.id, "2");
        assert_eq!(latest.data, "v-2");

        let err = s
            .events
            .get_latest("other", "image", &labels)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: no events found");
    }

    #[tokio::test]
    async fn ties_break_on_id() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        s.events.add(&event("b", "n", &[], 10)).await.unwrap();
        s.events.add(&event("a", "n", &[], 10)).await.unwrap();
        let latest = s.events.get_latest("proj", "n", &HashMap::new()).await.unwrap();
        assert_eq!(latest.id, "a");
    }

    #[tokio::test]
    async fn lists_bounded_range_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        for (id, at) in [("1", 10), ("2", 20), ("3", 30), ("4", 40)] {
            s.events.add(&event(id, "n", &[], at)).await.unwrap();
        }
        s.events
            .update_status("2", EventStatus::Success, "done")
            .await
            .unwrap();

        let query = EventQuery {
            from: 20,
            to: 40,
            ..Default::default()
        };
        let ids: Vec<String> = s
            .events
            .list("proj", &query)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["2", "3"]);

        let query = EventQuery {
            descending: true,
            status: Some(EventStatus::NotHandled),
            ..Default::default()
        };
        let ids: Vec<String> = s
            .events
            .list("proj", &query)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["4", "3", "1"]);
    }
}
