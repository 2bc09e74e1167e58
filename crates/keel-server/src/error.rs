use keel_common::{
    error::KeelError,
    rpc::{ApiCode, RpcError},
};
use keel_database::KeelDatabaseError;
use thiserror::Error;

pub type KeelServerResult<T = (), E = KeelServerError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum KeelServerError {
    #[error("Server error: {0}")]
    ServerError(String),
    #[error("{0}")]
    Rpc(#[from] RpcError),
    #[error("Database error: {0}")]
    DatabaseError(#[from] KeelDatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeelServerError {
    pub fn code(&self) -> ApiCode {
        match self {
            KeelServerError::Rpc(e) => e.code,
            KeelServerError::DatabaseError(e) => e.code(),
            _ => ApiCode::Internal,
        }
    }
}

impl From<KeelServerError> for RpcError {
    fn from(error: KeelServerError) -> Self {
        match error {
            KeelServerError::Rpc(e) => e,
            KeelServerError::DatabaseError(e) => e.into(),
            other => RpcError::internal(other.to_string()),
        }
    }
}

impl From<KeelServerError> for KeelError {
    fn from(error: KeelServerError) -> Self {
        match error {
            KeelServerError::Rpc(e) => KeelError::Rpc(e),
            KeelServerError::DatabaseError(e) => e.into(),
            KeelServerError::Io(e) => KeelError::IOError(e),
            other => KeelError::Runtime(anyhow::anyhow!(other.to_string())),
        }
    }
}
