//! Error types for Superagent Core

use thiserror::Error;

/// Result type alias using Superagent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Superagent error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Session is inactive: {0}")]
    SessionInactive(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn invalid_cron(expr: &str, reason: impl Into<String>) -> Self {
        Error::InvalidCron {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Stateful connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connect failed for '{name}': {reason}")]
    ConnectFailed { name: String, reason: String },

    #[error("Health check failed for '{name}': {reason}")]
    Unhealthy { name: String, reason: String },

    #[error("Connecting '{name}' timed out after {secs} seconds")]
    Timeout { name: String, secs: u64 },

    #[error("Connection '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("Owner task for '{0}' exited before handing over the connection")]
    OwnerGone(String),

    #[error("Connection '{0}' is disabled")]
    Disabled(String),

    #[error("Invalid connection config for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },
}
