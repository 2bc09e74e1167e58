use keel_common::{error::KeelError, git::GitError, rpc::RpcError};
use thiserror::Error;

pub type KeelPipedResult<T = (), E = KeelPipedError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum KeelPipedError {
    #[error("{0}")]
    Rpc(#[from] RpcError),
    #[error("Git error: {0}")]
    Git(#[from] GitError),
    #[error("{0}")]
    Common(#[from] KeelError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl KeelPipedError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        KeelPipedError::Runtime(msg.into())
    }
}

impl From<KeelPipedError> for KeelError {
    fn from(error: KeelPipedError) -> Self {
        match error {
            KeelPipedError::Common(e) => e,
            KeelPipedError::Rpc(e) => KeelError::Rpc(e),
            KeelPipedError::Io(e) => KeelError::IOError(e),
            KeelPipedError::Git(e) => e.into(),
            KeelPipedError::InvalidConfig(e) => KeelError::InvalidConfig(e),
            KeelPipedError::Cancelled => KeelError::Interrupted,
            other => KeelError::Runtime(anyhow::anyhow!(other.to_string())),
        }
    }
}

impl From<tokio::task::JoinError> for KeelPipedError {
    fn from(error: tokio::task::JoinError) -> Self {
        KeelPipedError::Runtime(format!("task failed: {}", error))
    }
}
