//! Error types for cachelock-core

use thiserror::Error;

/// Core error type for cachelock operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration value failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration or frame could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Filesystem or socket failure
    #[error("IO error: {0}")]
    IoError(String),

    /// Peer sent something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Callback target could not be reached
    #[error("Client {client} unreachable: {reason}")]
    Unreachable {
        /// Client identifier (callback address)
        client: String,
        /// Underlying failure
        reason: String,
    },

    /// Input validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Build an [`Error::Unreachable`] for a callback target.
    pub fn unreachable(client: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unreachable {
            client: client.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

/// Result type alias for cachelock-core operations
pub type Result<T> = std::result::Result<T, Error>;
