use crate::rpc::RpcError;

pub type KeelResult<T = (), E = KeelError> = Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum KeelError {
    #[error("CLI error: {0}")]
    Cli(String),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
    #[error("Command error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("Git operation failed: {0}")]
    GitOperationFailed(String),
    #[error("Git url parse error: {0}")]
    GitUrlParseError(#[from] git_url_parse::GitUrlParseError),
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Interrupted")]
    Interrupted,
    #[error("Failed to run command: {0}")]
    FailedToRunUserCommand(String),
    #[error("Invalid application config: {0}")]
    InvalidConfig(String),
    #[error("Invalid Json: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("Invalid Yaml: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("{0}")]
    Rpc(#[from] RpcError),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("No data")]
    NoData,
}

impl From<Box<dyn std::error::Error + Send + Sync>> for KeelError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        KeelError::Runtime(anyhow::anyhow!("{:#?}", err))
    }
}
