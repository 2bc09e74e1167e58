use std::sync::Arc;

use keel_common::{
    model::{
        Piped, PipedConnectionStatus, PipedPlatformProvider, PipedRepository,
        PipedSecretEncryption,
    },
    time::now_unix,
};

use super::Collection;
use crate::{
    datastore::{DataStore, Kind},
    error::{KeelDatabaseError, KeelDatabaseResult},
};

/// What a piped reports about itself when it starts.
#[derive(Debug, Clone, Default)]
pub struct PipedMeta {
    pub version: String,
    pub platform_providers: Vec<PipedPlatformProvider>,
    pub repositories: Vec<PipedRepository>,
    pub secret_encryption: Option<PipedSecretEncryption>,
}

#[derive(Clone)]
pub struct PipedStore {
    collection: Collection<Piped>,
}

impl PipedStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            collection: Collection::new(ds, Kind::Piped),
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<Piped> {
        self.collection.get(id).await
    }

    pub async fn create(&self, piped: &Piped) -> KeelDatabaseResult {
        if piped.id.is_empty() || piped.project_id.is_empty() || piped.key_hash.is_empty() {
            return Err(KeelDatabaseError::InvalidArgument(
                "piped id, project id and key hash are required".into(),
            ));
        }
        let mut p = piped.clone();
        let now = now_unix();
        if p.created_at == 0 {
            p.created_at = now;
        }
        p.updated_at = now;
        self.collection.create(&p.id, &p).await
    }

    /// Stores the reported metadata and marks the piped online.
    pub async fn update_meta(&self, id: &str, meta: PipedMeta) -> KeelDatabaseResult<Piped> {
        self.collection
            .update(id, |p| {
                let now = now_unix();
                p.version = meta.version.clone();
                p.platform_providers = meta.platform_providers.clone();
                p.repositories = meta.repositories.clone();
                p.secret_encryption = meta.secret_encryption.clone();
                p.status = PipedConnectionStatus::Online;
                p.started_at = now;
                p.updated_at = now;
                Ok(true)
            })
            .await
    }

    pub async fn update_desired_version(&self, id: &str, version: &str) -> KeelDatabaseResult<Piped> {
        self.collection
            .update(id, |p| {
                if p.desired_version == version {
                    return Ok(false);
                }
                p.desired_version = version.to_string();
                p.updated_at = now_unix();
                Ok(true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::testing::stores;

    #[tokio::test]
    async fn meta_report_flips_status_online() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        let piped = Piped {
            id: "p1".to_string(),
            name: "piped".to_string(),
            project_id: "proj".to_string(),
            key_hash: Piped::hash_key("k"),
            ..Default::default()
        };
        s.pipeds.create(&piped).await.unwrap();
        assert_eq!(s.pipeds.get("p1").await.unwrap().status, PipedConnectionStatus::Unknown);

        let meta = PipedMeta {
            version: "v1.2.3".to_string(),
            repositories: vec![PipedRepository {
                id: "repo".to_string(),
                remote: "git@github.com:org/repo.git".to_string(),
                branch: "main".to_string(),
            }],
            ..Default::default()
        };
        let p = s.pipeds.update_meta("p1", meta).await.unwrap();
        assert_eq!(p.status, PipedConnectionStatus::Online);
        assert_eq!(p.version, "v1.2.3");
        assert_eq!(p.repositories.len(), 1);
        assert!(p.started_at > 0);
        assert!(p.check_key("k"));

        let err = s.pipeds.update_meta("nope", PipedMeta::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
