use keel_common::{
    error::KeelError,
    rpc::{ApiCode, RpcError},
};
use thiserror::Error;

pub type KeelDatabaseResult<T = (), E = KeelDatabaseError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum KeelDatabaseError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// A compare-and-swap write lost against a concurrent writer.
    #[error("version conflict on {0}")]
    VersionConflict(String),
    #[error("internal: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Database migration error: {0}")]
    DatabaseMigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("Invalid document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("File store error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeelDatabaseError {
    pub fn code(&self) -> ApiCode {
        match self {
            KeelDatabaseError::NotFound(_) => ApiCode::NotFound,
            KeelDatabaseError::AlreadyExists(_) => ApiCode::AlreadyExists,
            KeelDatabaseError::InvalidArgument(_) => ApiCode::InvalidArgument,
            KeelDatabaseError::FailedPrecondition(_) => ApiCode::FailedPrecondition,
            KeelDatabaseError::VersionConflict(_) => ApiCode::Unavailable,
            _ => ApiCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KeelDatabaseError::NotFound(_))
    }
}

impl From<KeelDatabaseError> for RpcError {
    fn from(error: KeelDatabaseError) -> Self {
        let code = error.code();
        let message = match &error {
            KeelDatabaseError::NotFound(m)
            | KeelDatabaseError::AlreadyExists(m)
            | KeelDatabaseError::InvalidArgument(m)
            | KeelDatabaseError::FailedPrecondition(m) => m.clone(),
            other => other.to_string(),
        };
        RpcError::new(code, message)
    }
}

impl From<KeelDatabaseError> for KeelError {
    fn from(error: KeelDatabaseError) -> Self {
        match error {
            KeelDatabaseError::Io(e) => KeelError::IOError(e),
            KeelDatabaseError::Json(e) => KeelError::Json { source: e },
            other => KeelError::Database(other.to_string()),
        }
    }
}
