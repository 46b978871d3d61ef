//! Error types for overlay operations

use thiserror::Error;

/// Errors that can occur during overlay addressing and tunnel operations
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Invalid CIDR notation
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// No free address left in the range
    #[error("no available addresses in {0}")]
    Exhausted(String),

    /// No free subnet left in the node network
    #[error("no available subnet in {0}")]
    SubnetsExhausted(String),

    /// Tunnel driver command failed
    #[error("tunnel driver error: {0}")]
    Driver(String),

    /// Reachability probe gave up
    #[error("host {0} unreachable: {1}")]
    Unreachable(String, String),

    /// Probe or driver call was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for overlay operations
pub type Result<T> = std::result::Result<T, OverlayError>;
