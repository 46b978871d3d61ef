//! Integration tests against a real managed `redis-server`.
//!
//! These require `redis-server` on `$PATH` and are ignored by default.
//! Run them with:
//!
//! ```sh
//! cargo test -p trellis-store --test redis_roundtrip -- --ignored
//! ```

use std::net::IpAddr;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;

use trellis_store::{
    KvStore, RedisStore, ReplicationControl, StoreProcess, StoreProcessConfig,
};

async fn launch(port: u16) -> (StoreProcess, RedisStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let process = StoreProcess::launch(StoreProcessConfig {
        data_dir: dir.path().join("store"),
        bind: IpAddr::from([127, 0, 0, 1]),
        port,
        replica_of: None,
    })
    .await
    .expect("redis-server should launch");
    let store = RedisStore::connect(&process.url())
        .await
        .expect("connect to launched store");
    (process, store, dir)
}

#[tokio::test]
#[ignore]
async fn test_command_surface_roundtrip() {
    let (mut process, store, _dir) = launch(16379).await;

    // strings with and without TTL
    store.set("trellis:key", b"secret").await.unwrap();
    assert_eq!(
        store.get("trellis:key").await.unwrap(),
        Some(b"secret".to_vec())
    );
    store
        .set_with_ttl("trellis:master", b"{}", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(store.get("trellis:master").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(
        store.get("trellis:master").await.unwrap().is_none(),
        "TTL-bound key lapses without a re-write"
    );

    // prefix listing
    store.set("trellis:nodes:a", b"1").await.unwrap();
    store.set("trellis:nodes:b", b"2").await.unwrap();
    let mut keys = store.keys("trellis:nodes:*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["trellis:nodes:a", "trellis:nodes:b"]);

    // sets and hashes
    store.sadd("trellis:authorized", "p1").await.unwrap();
    store.sadd("trellis:authorized", "p2").await.unwrap();
    store.srem("trellis:authorized", "p1").await.unwrap();
    assert_eq!(store.smembers("trellis:authorized").await.unwrap(), vec!["p2"]);

    store.hset("trellis:peerips", "p1", "10.51.0.2").await.unwrap();
    let ips = store.hgetall("trellis:peerips").await.unwrap();
    assert_eq!(ips["p1"], "10.51.0.2");
    store.hdel("trellis:peerips", "p1").await.unwrap();
    assert!(store.hgetall("trellis:peerips").await.unwrap().is_empty());

    process.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_pubsub_delivery() {
    let (mut process, store, _dir) = launch(16380).await;

    let mut events = store
        .subscribe("trellis:events:restart-tunnel")
        .await
        .unwrap();
    // subscription setup races the publish on a fresh connection
    tokio::time::sleep(Duration::from_millis(100)).await;

    store
        .publish("trellis:events:restart-tunnel", b"restart")
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("event within two seconds")
        .expect("stream open");
    assert_eq!(event, b"restart".to_vec());

    process.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_promote_and_link_status() {
    let (mut process, store, _dir) = launch(16381).await;

    // a standalone instance has no primary link
    assert!(!store.link_up().await.unwrap());

    // promotion is idempotent on a primary
    store.promote().await.unwrap();
    assert!(!store.link_up().await.unwrap());

    process.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_replica_follows_primary() {
    let (mut primary_proc, primary, _dir_a) = launch(16382).await;
    let (mut replica_proc, replica, _dir_b) = launch(16383).await;

    replica.follow("127.0.0.1", 16382).await.unwrap();

    // wait for the link, then confirm replicated reads
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !replica.link_up().await.unwrap() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "replication link should come up"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    primary.set("trellis:nodes:a", b"record").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        replica.get("trellis:nodes:a").await.unwrap(),
        Some(b"record".to_vec())
    );

    // writes against the read-only replica fail
    assert!(replica.set("trellis:nodes:b", b"nope").await.is_err());

    // promotion clears the replica role and restores writes
    replica.promote().await.unwrap();
    replica.set("trellis:nodes:b", b"now-primary").await.unwrap();

    replica_proc.shutdown().await.unwrap();
    primary_proc.shutdown().await.unwrap();
}
