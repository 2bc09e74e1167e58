pub mod database;
pub mod datastore;
pub mod error;
pub mod filestore;
pub mod repos;

use std::sync::Arc;

pub use database::{get_app_database, AppDatabase};
pub use datastore::{DataStore, MemoryDataStore, PostgresDataStore};
pub use error::{KeelDatabaseError, KeelDatabaseResult};
pub use filestore::{FileStore, LocalFileStore};
pub use repos::*;

use keel_common::settings::{DataStoreType, Settings};

/// Opens the datastore and file store described by the settings.
pub async fn open_stores(settings: &Settings) -> KeelDatabaseResult<Stores> {
    let ds: Arc<dyn DataStore> = match settings.datastore.r#type {
        DataStoreType::Memory => Arc::new(MemoryDataStore::new()),
        DataStoreType::Postgres => {
            let url = settings.datastore.url.as_deref().ok_or_else(|| {
                KeelDatabaseError::InvalidArgument("datastore.url is required for postgres".into())
            })?;
            let db = get_app_database(url, settings.datastore.max_connections).await?;
            Arc::new(PostgresDataStore::new(db))
        }
    };
    tracing::info!(
        datastore = ?settings.datastore.r#type,
        filestore = %settings.filestore_dir.display(),
        "opened control-plane stores"
    );
    let fs: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(settings.filestore_dir.clone()));
    Ok(Stores::new(ds, fs))
}
