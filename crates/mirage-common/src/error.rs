//! Common error types for Mirage.

use thiserror::Error;

/// Result type alias using Mirage's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Mirage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Signaling error
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Media pipeline error
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a pipeline error from any displayable type.
    pub fn pipeline(msg: impl std::fmt::Display) -> Self {
        Self::Pipeline(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}
