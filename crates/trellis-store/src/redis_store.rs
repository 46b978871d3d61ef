//! Redis-backed store implementation
//!
//! Commands run over a tokio connection manager which transparently
//! reconnects; a broken connection therefore surfaces as command errors
//! that the enclosing loops retry on their next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;

use crate::error::{Result, StoreError};
use crate::{EventStream, KvStore, ReplicationControl, StoreConnector};

/// Store client over a single Redis instance
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    url: String,
}

impl RedisStore {
    /// Connect to the store at the given `redis://host:port` URL
    pub async fn connect(store_url: &str) -> Result<Self> {
        let client = redis::Client::open(store_url)
            .map_err(|e| StoreError::InvalidUrl(format!("{store_url}: {e}")))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            client,
            manager,
            url: store_url.to_string(),
        })
    }

    /// URL this store was dialed at
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn command<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.manager.clone();
        Ok(cmd.query_async(&mut conn).await?)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.command(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.command(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.command(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1)),
        )
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.command(redis::cmd("DEL").arg(key)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.command(redis::cmd("KEYS").arg(pattern)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.command(redis::cmd("SADD").arg(key).arg(member)).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.command(redis::cmd("SREM").arg(key).arg(member)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.command(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.command(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.command(redis::cmd("HDEL").arg(key).arg(field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.command(redis::cmd("HGETALL").arg(key)).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.command(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed();
        Ok(stream)
    }
}

#[async_trait]
impl ReplicationControl for RedisStore {
    async fn follow(&self, host: &str, port: u16) -> Result<()> {
        self.command(redis::cmd("REPLICAOF").arg(host).arg(port))
            .await
    }

    async fn promote(&self) -> Result<()> {
        self.command(redis::cmd("REPLICAOF").arg("NO").arg("ONE"))
            .await
    }

    async fn link_up(&self) -> Result<bool> {
        let info: String = self.command(redis::cmd("INFO").arg("REPLICATION")).await?;
        Ok(replication_link_up(&info))
    }
}

/// Parse `INFO REPLICATION` output for an established primary link
fn replication_link_up(info: &str) -> bool {
    info.lines()
        .filter_map(|line| line.trim().split_once(':'))
        .any(|(key, value)| key == "master_link_status" && value.trim() == "up")
}

/// [`StoreConnector`] dialing real Redis instances
pub struct RedisConnector;

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self, store_url: &str) -> Result<Arc<dyn KvStore>> {
        Ok(Arc::new(RedisStore::connect(store_url).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_link_up_parsing() {
        let info = "# Replication\r\nrole:slave\r\nmaster_host:10.10.0.1\r\nmaster_link_status:up\r\n";
        assert!(replication_link_up(info));

        let down = "# Replication\r\nrole:slave\r\nmaster_link_status:down\r\n";
        assert!(!replication_link_up(down));

        let master = "# Replication\r\nrole:master\r\nconnected_slaves:1\r\n";
        assert!(!replication_link_up(master));
    }
}
