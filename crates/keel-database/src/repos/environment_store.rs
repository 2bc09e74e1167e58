use std::sync::Arc;

use keel_common::{model::Environment, time::now_unix};

use super::Collection;
use crate::{
    datastore::{DataStore, Kind},
    error::{KeelDatabaseError, KeelDatabaseResult},
};

#[derive(Clone)]
pub struct EnvironmentStore {
    collection: Collection<Environment>,
}

impl EnvironmentStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            collection: Collection::new(ds, Kind::Environment),
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<Environment> {
        self.collection.get(id).await
    }

    pub async fn create(&self, env: &Environment) -> KeelDatabaseResult {
        if env.id.is_empty() || env.project_id.is_empty() {
            return Err(KeelDatabaseError::InvalidArgument(
                "environment id and project id are required".into(),
            ));
        }
        let mut e = env.clone();
        let now = now_unix();
        if e.created_at == 0 {
            e.created_at = now;
        }
        e.updated_at = now;
        self.collection.create(&e.id, &e).await
    }
}
