/// Shared error and result types for polyrun
use thiserror::Error;

/// Errors raised inside the execution engine.
///
/// None of these reach the caller of `submit` directly: the orchestrator
/// converts every variant into a `SystemError` result at the request boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<nix::errno::Errno> for EngineError {
    fn from(err: nix::errno::Errno) -> Self {
        EngineError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Result type alias for polyrun operations
pub type Result<T> = std::result::Result<T, EngineError>;
