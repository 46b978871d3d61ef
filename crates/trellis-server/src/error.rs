//! Error types for control-plane operations

use thiserror::Error;

/// Errors that can occur in the control plane
#[derive(Debug, Error)]
pub enum ServerError {
    /// Cluster key mismatch on join
    #[error("invalid cluster key specified")]
    InvalidAuth,

    /// No primary descriptor present
    #[error("no configured master")]
    NoMaster,

    /// Peer is not in the authorised set
    #[error("peer {0} is not authorized")]
    AccessDenied(String),

    /// Route already reserved
    #[error("route {0} already reserved")]
    RouteExists(String),

    /// Referenced node does not exist
    #[error("node {0} does not exist")]
    NodeNotFound(String),

    /// Store operation failed
    #[error(transparent)]
    Store(#[from] trellis_store::StoreError),

    /// Addressing or tunnel operation failed
    #[error(transparent)]
    Overlay(#[from] trellis_overlay::OverlayError),

    /// Stored record failed to parse
    #[error("record error: {0}")]
    Record(#[from] serde_json::Error),

    /// Outbound RPC failed
    #[error("RPC error: {0}")]
    Rpc(#[from] trellis_proto::ClientError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Timed out waiting for a cluster condition
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, ServerError>;
