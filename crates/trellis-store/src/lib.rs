//! Trellis Store - replicated key-value store abstraction
//!
//! The cluster state lives in a single-primary replicated Redis. This crate
//! keeps the rest of the control plane behind narrow capability sets:
//!
//! - [`KvStore`] - the command surface the control plane relies on
//!   (GET/SET with TTL, sets, hashes, prefix KEYS, pub/sub)
//! - [`ReplicationControl`] - primary/replica switching and link status
//! - [`StoreConnector`] - dialing a store by URL (rebind onto the overlay)
//! - [`RedisStore`] - the real backend over a tokio connection manager
//! - [`MemoryStore`] - in-memory fake for tests and local development
//! - [`embedded`] - the managed `redis-server` child process
//! - [`StoreHandle`] - atomically swappable writable-store handle

pub mod embedded;
mod error;
mod handle;
mod memory;
mod redis_store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use embedded::{StoreProcess, StoreProcessConfig};
pub use error::{Result, StoreError};
pub use handle::StoreHandle;
pub use memory::{MemoryConnector, MemoryStore};
pub use redis_store::{RedisConnector, RedisStore};

/// Stream of pub/sub payloads for a single channel subscription
pub type EventStream = futures::stream::BoxStream<'static, Vec<u8>>;

/// The store command surface the control plane relies on
///
/// Values are opaque bytes; callers serialize records themselves. Writes
/// against a read-only replica fail and are retried by the enclosing loop.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// SET with expiry; the key vanishes when the TTL lapses without a re-write
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// KEYS limited to trailing-`*` prefix patterns
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<EventStream>;
}

/// Primary/replica control over the local store instance
#[async_trait]
pub trait ReplicationControl: Send + Sync {
    /// Reconfigure the local store as a replica of the given primary
    async fn follow(&self, host: &str, port: u16) -> Result<()>;
    /// Clear any replica-of setting and resume accepting writes
    async fn promote(&self) -> Result<()>;
    /// Whether the replication link to the primary is established
    async fn link_up(&self) -> Result<bool>;
}

/// Dial a store by URL
///
/// The controller rebinds its writable handle through this when following a
/// new primary; tests supply [`MemoryConnector`] so a "remote" store is the
/// same shared in-memory instance.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn KvStore>>;
}

/// Parse `redis://host:port` into its host and port
pub fn parse_store_url(store_url: &str) -> Result<(String, u16)> {
    let parsed = url::Url::parse(store_url)
        .map_err(|e| StoreError::InvalidUrl(format!("{store_url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| StoreError::InvalidUrl(format!("{store_url}: missing host")))?
        .to_string();
    let port = parsed
        .port()
        .ok_or_else(|| StoreError::InvalidUrl(format!("{store_url}: missing port")))?;
    Ok((host, port))
}
