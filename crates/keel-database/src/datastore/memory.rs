use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use keel_common::time::now_unix;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{DataStore, Document, Kind, ListOptions};
use crate::error::{KeelDatabaseError, KeelDatabaseResult};

/// A process-local store, used for single node setups and tests.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    collections: RwLock<HashMap<Kind, BTreeMap<String, Document>>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: Kind, id: &str) -> KeelDatabaseError {
    KeelDatabaseError::NotFound(format!("{} {} was not found", kind, id))
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn get(&self, kind: Kind, id: &str) -> KeelDatabaseResult<Document> {
        let collections = self.collections.read().await;
        collections
            .get(&kind)
            .and_then(|c| c.get(id))
            .cloned()
            .ok_or_else(|| not_found(kind, id))
    }

    async fn create(&self, kind: Kind, id: &str, data: Value) -> KeelDatabaseResult<Document> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(kind).or_default();
        if collection.contains_key(id) {
            return Err(KeelDatabaseError::AlreadyExists(format!(
                "{} {} already exists",
                kind, id
            )));
        }
        let now = now_unix();
        let doc = Document {
            id: id.to_string(),
            version: 1,
            data,
            created_at: now,
            updated_at: now,
        };
        collection.insert(id.to_string(), doc.clone());
        Ok(doc)
    }

    async fn put(&self, kind: Kind, id: &str, data: Value) -> KeelDatabaseResult<Document> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(kind).or_default();
        let now = now_unix();
        let doc = match collection.get(id) {
            Some(prev) => Document {
                id: id.to_string(),
                version: prev.version + 1,
                data,
                created_at: prev.created_at,
                updated_at: now,
            },
            None => Document {
                id: id.to_string(),
                version: 1,
                data,
                created_at: now,
                updated_at: now,
            },
        };
        collection.insert(id.to_string(), doc.clone());
        Ok(doc)
    }

    async fn update(
        &self,
        kind: Kind,
        id: &str,
        version: i64,
        data: Value,
    ) -> KeelDatabaseResult<Document> {
        let mut collections = self.collections.write().await;
        let current = collections
            .get_mut(&kind)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| not_found(kind, id))?;
        if current.version != version {
            return Err(KeelDatabaseError::VersionConflict(format!("{} {}", kind, id)));
        }
        current.version += 1;
        current.data = data;
        current.updated_at = now_unix();
        Ok(current.clone())
    }

    async fn list(&self, kind: Kind, opts: &ListOptions) -> KeelDatabaseResult<Vec<Document>> {
        opts.validate()?;
        let collections = self.collections.read().await;
        let mut docs: Vec<Document> = collections
            .get(&kind)
            .map(|c| {
                c.values()
                    .filter(|d| opts.filters.iter().all(|f| f.matches(&d.data)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        opts.sort(&mut docs);
        if opts.limit > 0 {
            docs.truncate(opts.limit);
        }
        Ok(docs)
    }
}
