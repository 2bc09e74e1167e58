use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::manifest::{Manifest, ResourceKey};

/// Result of comparing the manifests in Git with the live ones.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiffResult {
    /// In Git but not in the cluster.
    pub adds: Vec<ResourceKey>,
    /// In the cluster but not in Git.
    pub deletes: Vec<ResourceKey>,
    pub changes: Vec<ResourceKey>,
}

impl DiffResult {
    pub fn total(&self) -> usize {
        self.adds.len() + self.deletes.len() + self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "There are {} manifests not synced ({} adds, {} deletes, {} changes)",
            self.total(),
            self.adds.len(),
            self.deletes.len(),
            self.changes.len()
        )
    }
}

/// Compares `head` with `live` by resource key.
///
/// A resource counts as changed when some field set in Git differs from the
/// live object; fields only present live (defaults, status) are ignored.
/// `ignore_fields` entries look like `apps/v1:Deployment:default:web#spec.replicas`.
pub fn diff_manifests(head: &[Manifest], live: &[Manifest], ignore_fields: &[String]) -> DiffResult {
    let mut ignored: HashMap<String, Vec<Vec<&str>>> = HashMap::new();
    for entry in ignore_fields {
        if let Some((key, path)) = entry.split_once('#') {
            ignored
                .entry(key.to_string())
                .or_default()
                .push(path.split('.').collect());
        }
    }

    let live: BTreeMap<&ResourceKey, &Manifest> = live.iter().map(|m| (&m.key, m)).collect();
    let head_map: BTreeMap<&ResourceKey, &Manifest> = head.iter().map(|m| (&m.key, m)).collect();

    let mut result = DiffResult::default();
    for (key, manifest) in &head_map {
        match live.get(key) {
            None => result.adds.push((*key).clone()),
            Some(live) => {
                let mut desired = manifest.body.clone();
                for path in ignored.get(&key.to_string()).into_iter().flatten() {
                    remove_path(&mut desired, path);
                }
                if !is_subset(&desired, &live.body) {
                    result.changes.push((*key).clone());
                }
            }
        }
    }
    for key in live.keys() {
        if !head_map.contains_key(key) {
            result.deletes.push((*key).clone());
        }
    }
    result
}

fn remove_path(v: &mut Value, path: &[&str]) {
    match path {
        [] => {}
        [last] => {
            if let Some(map) = v.as_object_mut() {
                map.remove(*last);
            }
        }
        [first, rest @ ..] => {
            if let Some(child) = v.get_mut(*first) {
                remove_path(child, rest);
            }
        }
    }
}

fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => is_subset(dv, lv),
            None => dv.is_null() || is_empty_collection(dv),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_subset(dv, lv))
        }
        (Value::Number(d), Value::Number(l)) => d.as_f64() == l.as_f64(),
        // Quantities and ports are often written as numbers but stored as strings.
        (Value::Number(d), Value::String(l)) | (Value::String(l), Value::Number(d)) => {
            d.to_string() == *l
        }
        (d, l) => d == l,
    }
}

fn is_empty_collection(v: &Value) -> bool {
    match v {
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}
