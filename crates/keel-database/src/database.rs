use std::time::Duration;

use crate::error::{KeelDatabaseError, KeelDatabaseResult};

pub async fn get_app_database(
    database_url: &str,
    max_connections: u32,
) -> KeelDatabaseResult<AppDatabase> {
    let db = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    AppDatabase::new(db).await
}

#[derive(Debug, Clone)]
pub struct AppDatabase {
    pub db: sqlx::postgres::PgPool,
}

impl AppDatabase {
    pub async fn new(db: sqlx::postgres::PgPool) -> KeelDatabaseResult<Self> {
        let db = Self { db };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn get_pool(&self) -> &sqlx::postgres::PgPool {
        &self.db
    }

    async fn run_migrations(&self) -> KeelDatabaseResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.db)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                KeelDatabaseError::DatabaseMigrationError(e)
            })
    }
}
