use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::cache::CryptoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    #[default]
    NotHandled,
    Success,
    Failure,
    Outdated,
}

impl EventStatus {
    pub fn is_handled(&self) -> bool {
        !matches!(self, EventStatus::NotHandled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub event_key: String,
    #[serde(default)]
    pub data: String,
    pub project_id: String,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub status_description: String,
    #[serde(default)]
    pub contexts: HashMap<String, String>,
    #[serde(default)]
    pub handled_at: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

/// Builds the stable key identifying every event sharing the same name and labels.
pub fn make_event_key(name: &str, labels: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<&String, &String> = labels.iter().collect();
    let mut raw = String::from(name);
    for (k, v) in sorted {
        raw.push('\u{0}');
        raw.push_str(k);
        raw.push('=');
        raw.push_str(v);
    }
    raw.crypto_hash()
}

impl Event {
    /// Whether this event carries the given name and at least the given labels.
    pub fn matches(&self, name: &str, labels: &HashMap<String, String>) -> bool {
        self.name == name && labels.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }

    /// Whether this event replaces `other` for the same event key.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.event_key == other.event_key
            && (self.created_at > other.created_at
                || (self.created_at == other.created_at && self.id < other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn event_key_is_order_independent() {
        let a = make_event_key("image", &labels(&[("env", "dev"), ("app", "a")]));
        let b = make_event_key("image", &labels(&[("app", "a"), ("env", "dev")]));
        assert_eq!(a, b);
    }

    #[test]
    fn event_key_distinguishes_name_and_labels() {
        let base = make_event_key("image", &labels(&[("env", "dev")]));
        assert_ne!(base, make_event_key("image2", &labels(&[("env", "dev")])));
        assert_ne!(base, make_event_key("image", &labels(&[("env", "prd")])));
        assert_ne!(base, make_event_key("image", &HashMap::new()));
    }

    #[test]
    fn newer_event_supersedes_older() {
        let key = make_event_key("n", &HashMap::new());
        let old = Event {
            id: "1".to_string(),
            event_key: key.clone(),
            created_at: 10,
            ..Default::default()
        };
        let new = Event {
            id: "2".to_string(),
            event_key: key,
            created_at: 20,
            ..Default::default()
        };
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
    }
}
