//! In-memory store for tests and local development
//!
//! Implements the full [`KvStore`] surface plus trivial replication
//! control. TTLs are tracked against the tokio clock so paused-clock tests
//! can drive expiry deterministically. Pub/sub fans out over per-channel
//! unbounded channels.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;
use crate::{EventStream, KvStore, ReplicationControl, StoreConnector};

#[derive(Default)]
struct Shared {
    strings: HashMap<String, (Vec<u8>, Option<Instant>)>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Shared {
    fn expire_now(&mut self) {
        let now = Instant::now();
        self.strings
            .retain(|_, (_, deadline)| deadline.map(|d| d > now).unwrap_or(true));
    }
}

/// Shared in-memory [`KvStore`]
///
/// Clones share state, so a cluster of controllers pointed at clones of one
/// `MemoryStore` behaves like perfectly replicated nodes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_now();
        Ok(inner.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), (value.to_vec(), None));
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key.to_string(),
            (value.to_vec(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        inner.sets.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_now();
        let matches: Box<dyn Fn(&str) -> bool> = match pattern.strip_suffix('*') {
            Some(prefix) => {
                let prefix = prefix.to_string();
                Box::new(move |k: &str| k.starts_with(&prefix))
            }
            None => {
                let exact = pattern.to_string();
                Box::new(move |k: &str| k == exact)
            }
        };
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .filter(|k| matches(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(senders) = inner.subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Box::pin(MessageStream { rx }))
    }
}

#[async_trait]
impl ReplicationControl for MemoryStore {
    async fn follow(&self, _host: &str, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        Ok(())
    }

    async fn link_up(&self) -> Result<bool> {
        Ok(true)
    }
}

struct MessageStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Stream for MessageStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// [`StoreConnector`] handing out clones of one shared [`MemoryStore`]
///
/// A controller "dialing the primary's store" then reads and writes the
/// same state as every other controller in the test, which is exactly what
/// an established replication link looks like from the outside.
pub struct MemoryConnector {
    store: MemoryStore,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, _store_url: &str) -> Result<Arc<dyn KvStore>> {
        Ok(Arc::new(self.store.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_get_set_del() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", b"v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", b"v", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.keys("k*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_prefix() {
        let store = MemoryStore::new();
        store.set("trellis:nodes:a", b"1").await.unwrap();
        store.set("trellis:nodes:b", b"2").await.unwrap();
        store.set("trellis:peers:a", b"3").await.unwrap();

        let keys = store.keys("trellis:nodes:*").await.unwrap();
        assert_eq!(keys, vec!["trellis:nodes:a", "trellis:nodes:b"]);
    }

    #[tokio::test]
    async fn test_sets_and_hashes() {
        let store = MemoryStore::new();
        store.sadd("auth", "p1").await.unwrap();
        store.sadd("auth", "p2").await.unwrap();
        store.srem("auth", "p1").await.unwrap();
        assert_eq!(store.smembers("auth").await.unwrap(), vec!["p2"]);

        store.hset("ips", "p1", "10.51.0.2").await.unwrap();
        store.hset("ips", "p2", "10.51.0.3").await.unwrap();
        store.hdel("ips", "p2").await.unwrap();
        let all = store.hgetall("ips").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["p1"], "10.51.0.2");
    }

    #[tokio::test]
    async fn test_pubsub_fanout() {
        let store = MemoryStore::new();
        let mut sub1 = store.subscribe("events").await.unwrap();
        let mut sub2 = store.subscribe("events").await.unwrap();

        store.publish("events", b"restart").await.unwrap();

        assert_eq!(sub1.next().await.unwrap(), b"restart".to_vec());
        assert_eq!(sub2.next().await.unwrap(), b"restart".to_vec());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.set("k", b"v").await.unwrap();
        assert_eq!(clone.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
