//! Error types for store operations

use thiserror::Error;

/// Errors that can occur against the replicated store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis command or connection error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Store unreachable or not yet ready
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Malformed store URL
    #[error("invalid store URL: {0}")]
    InvalidUrl(String),

    /// Managed store process failed to launch or exited
    #[error("store process error: {0}")]
    Process(String),

    /// Timed out waiting for a store condition
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
