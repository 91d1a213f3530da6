//! Error types used across the opsipxeconfd daemon.

use thiserror::Error;

/// Result type for opsipxeconfd operations.
pub type OpsipxeconfdResult<T> = Result<T, OpsipxeconfdError>;

#[derive(Debug, Error)]
pub enum OpsipxeconfdError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid host id '{0}'")]
    InvalidHostId(String),

    #[error("no address for host '{0}'")]
    NoAddress(String),

    #[error("address collision: clients '{0}' and '{1}' resolve to '{2}'")]
    AddressCollision(String, String, String),

    #[error("template error: {0}")]
    Template(String),

    #[error("pipe error on '{0}': {1}")]
    Pipe(String, String),

    #[error("control protocol error: {0}")]
    Control(String),

    #[error("internal error: {0}")]
    Internal(String),
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for OpsipxeconfdError {
    fn from(err: std::io::Error) -> Self {
        OpsipxeconfdError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for OpsipxeconfdError {
    fn from(err: serde_json::Error) -> Self {
        OpsipxeconfdError::Backend(format!("JSON error: {}", err))
    }
}

impl From<String> for OpsipxeconfdError {
    fn from(err: String) -> Self {
        OpsipxeconfdError::Internal(err)
    }
}

impl From<&str> for OpsipxeconfdError {
    fn from(err: &str) -> Self {
        OpsipxeconfdError::Internal(err.to_string())
    }
}
