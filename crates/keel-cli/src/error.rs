use keel_common::error::KeelError;
use keel_piped::KeelPipedError;
use keel_server::KeelServerError;
use thiserror::Error;

pub type KeelCliResult<T = (), E = KeelCliError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum KeelCliError {
    #[error("Unable to initialize config: {0}")]
    InitConfig(String),
    #[error("Unable to parse config: {0}")]
    ParseConfig(String),
    #[error("Unable to run command: {0}")]
    Command(#[from] clap::error::Error),
    #[error("Piped error: {0}")]
    Piped(#[from] KeelPipedError),
    #[error("Server error: {0}")]
    Server(#[from] KeelServerError),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<KeelCliError> for KeelError {
    fn from(error: KeelCliError) -> Self {
        KeelError::Cli(error.to_string())
    }
}

impl From<KeelError> for KeelCliError {
    fn from(error: KeelError) -> Self {
        match error {
            KeelError::InvalidConfig(e) => KeelCliError::ParseConfig(e),
            KeelError::Config(e) => KeelCliError::ParseConfig(e.to_string()),
            e => KeelCliError::Runtime(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for KeelCliError {
    fn from(error: anyhow::Error) -> Self {
        KeelCliError::Runtime(error.to_string())
    }
}

impl From<std::io::Error> for KeelCliError {
    fn from(error: std::io::Error) -> Self {
        KeelCliError::Runtime(error.to_string())
    }
}
