//! End-to-end tests for the Trellis control plane.
//!
//! Nodes share one in-memory store, which behaves like a cluster whose
//! replication links are instantaneously in sync; tunnel drivers are
//! recording fakes. The RPC surface is served on loopback and exercised
//! through the real client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use trellis_overlay::config::{render_node, NodeConfigSpec};
use trellis_overlay::probe::AlwaysReachable;
use trellis_overlay::{TunnelDriver, TunnelManager};
use trellis_proto::{codes, Client, JoinRequest, Peer};
use trellis_server::config::{Config, NODE_HEARTBEAT_EXPIRY};
use trellis_server::rpc::{router, AppState};
use trellis_server::updater::Updater;
use trellis_server::{Controller, Registry, Role};
use trellis_store::{KvStore, MemoryConnector, MemoryStore, StoreHandle};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct RecordingDriver(Arc<AtomicUsize>);

#[async_trait::async_trait]
impl TunnelDriver for RecordingDriver {
    async fn restart(&self, _interface: &str) -> trellis_overlay::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestNode {
    cfg: Arc<Config>,
    registry: Arc<Registry>,
    controller: Arc<Controller>,
    updater: Arc<Updater>,
    restarts: Arc<AtomicUsize>,
    _dir: TempDir,
}

fn node_config(id: &str, seed: Option<String>, dir: &TempDir) -> Config {
    Config {
        id: id.to_string(),
        name: id.to_string(),
        data_dir: dir.path().to_path_buf(),
        store_port: 6379,
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        advertise_addr: format!("127.0.0.1:9{}00", id.len()),
        seed_addr: seed,
        cluster_key: "test-cluster-key".to_string(),
        node_network: "10.10.0.0/16".parse().unwrap(),
        peer_network: "10.51.0.0/16".parse().unwrap(),
        endpoint_ip: format!("203.0.113.{}", 10 + id.len()),
        endpoint_port: 51820,
        dns_listen: "127.0.0.1:0".parse().unwrap(),
        dns_upstream: "127.0.0.1:1".parse().unwrap(),
        interface_name: "trellis0".to_string(),
        underlay_interface: "eth0".to_string(),
        config_dir: dir.path().join("wg"),
        authorized_peers: Vec::new(),
        tls_identity: None,
        tls_skip_verify: false,
    }
}

/// Assemble and start a node against the shared store, mirroring the
/// daemon's startup sequence
async fn start_node(
    id: &str,
    shared: &MemoryStore,
    seed: Option<String>,
    run_updater: bool,
) -> TestNode {
    let dir = TempDir::new().unwrap();
    let cfg = Arc::new(node_config(id, seed, &dir));

    let local: Arc<dyn KvStore> = Arc::new(shared.clone());
    let registry = Arc::new(Registry::new(local.clone(), StoreHandle::new(local)));

    let restarts = Arc::new(AtomicUsize::new(0));
    let tunnel = Arc::new(TunnelManager::new(
        &cfg.config_dir,
        &cfg.interface_name,
        Box::new(RecordingDriver(restarts.clone())),
    ));

    let controller = Controller::new(
        cfg.clone(),
        registry.clone(),
        Arc::new(shared.clone()),
        Arc::new(MemoryConnector::new(shared.clone())),
        tunnel.clone(),
        Arc::new(AlwaysReachable),
        CancellationToken::new(),
    );
    // a founding node establishes its identity before entering, so the
    // first primary descriptor already carries the overlay gateway; a
    // joiner's identity is assigned by the primary during Join
    if cfg.seed_addr.is_none() {
        registry.get_or_create_keypair(&cfg.id).await.unwrap();
        registry
            .ensure_node_subnet(&cfg.id, cfg.node_network)
            .await
            .unwrap();
    }

    controller.start().await.expect("controller start");

    registry.get_or_create_keypair(&cfg.id).await.unwrap();
    registry
        .ensure_node_subnet(&cfg.id, cfg.node_network)
        .await
        .unwrap();
    controller.update_local_node().await.unwrap();

    let updater = Updater::new(cfg.clone(), registry.clone(), tunnel);
    if run_updater {
        updater.run_once().await.unwrap();
    }

    TestNode {
        cfg,
        registry,
        controller,
        updater,
        restarts,
        _dir: dir,
    }
}

/// Serve the node's RPC surface on loopback
async fn spawn_rpc(node: &TestNode) -> (SocketAddr, CancellationToken) {
    let state = AppState {
        cfg: node.cfg.clone(),
        registry: node.registry.clone(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });
    (addr, cancel)
}

fn client(addr: SocketAddr) -> Client {
    Client::new(&addr.to_string()).unwrap()
}

// ---------------------------------------------------------------------------
// 1. Single-node bootstrap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_node_bootstrap() {
    let shared = MemoryStore::new();
    let node = start_node("a", &shared, None, true).await;

    assert_eq!(node.controller.current_role(), Role::Primary);

    let subnet = node.registry.node_subnet("a").await.unwrap().unwrap();
    assert_eq!(subnet.to_string(), "10.10.0.0/24");
    assert_eq!(
        node.registry.gateway_ip("a").await.unwrap().unwrap().to_string(),
        "10.10.0.1"
    );

    let master = node.registry.master().await.unwrap().expect("master present");
    assert_eq!(master.id, "a");
    assert_eq!(master.gateway_ip, "10.10.0.1");
    assert_eq!(master.store_url, "redis://10.10.0.1:6379");
}

// ---------------------------------------------------------------------------
// 2/3. Peer allocation through Connect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_peer_allocation() {
    let shared = MemoryStore::new();
    // updater has not run yet, so only client peers appear in the list
    let node = start_node("a", &shared, None, false).await;
    let (addr, _guard) = spawn_rpc(&node).await;
    let client = client(addr);

    client.authorize_peer("p1").await.unwrap();
    let resp = client.connect("p1", "one").await.unwrap();

    assert_eq!(resp.address, "10.51.0.2/16");
    assert_eq!(resp.dns, vec!["10.10.0.1"]);
    assert!(resp.peers.is_empty(), "first peer sees an empty peer list");
    assert_eq!(resp.key_pair.private_key.len(), 44);
}

#[tokio::test]
async fn test_second_peer_sees_the_first() {
    let shared = MemoryStore::new();
    let node = start_node("a", &shared, None, false).await;
    let (addr, _guard) = spawn_rpc(&node).await;
    let client = client(addr);

    client.authorize_peer("p1").await.unwrap();
    client.authorize_peer("p2").await.unwrap();
    client.connect("p1", "one").await.unwrap();

    let resp = client.connect("p2", "two").await.unwrap();
    assert_eq!(resp.address, "10.51.0.3/16");
    assert_eq!(resp.peers.len(), 1);
    assert_eq!(resp.peers[0].id, "p1");
    assert_eq!(resp.peers[0].endpoint, "");
    assert_eq!(resp.peers[0].peer_ip, "10.51.0.2");

    // p1 sees p2 on its next sync
    let resp = client.connect("p1", "one").await.unwrap();
    assert_eq!(resp.address, "10.51.0.2/16", "address is stable across syncs");
    assert_eq!(resp.peers.len(), 1);
    assert_eq!(resp.peers[0].id, "p2");
    assert_eq!(resp.peers[0].endpoint, "");
}

// ---------------------------------------------------------------------------
// Auth gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_requires_authorisation() {
    let shared = MemoryStore::new();
    let node = start_node("a", &shared, None, true).await;
    let (addr, _guard) = spawn_rpc(&node).await;
    let client = client(addr);

    let err = client.connect("intruder", "x").await.unwrap_err();
    assert_eq!(err.code(), Some(codes::ACCESS_DENIED));

    // the rejected connect left no trace
    assert!(node.registry.peer("intruder").await.unwrap().is_none());
    let ips = node.registry.local().hgetall("trellis:peerips").await.unwrap();
    assert!(!ips.contains_key("intruder"));
}

// ---------------------------------------------------------------------------
// Deauthorisation propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_deauthorize_evicts_peer_and_notifies() {
    let shared = MemoryStore::new();
    let node = start_node("a", &shared, None, true).await;
    let (addr, _guard) = spawn_rpc(&node).await;
    let client = client(addr);

    client.authorize_peer("p1").await.unwrap();
    client.connect("p1", "one").await.unwrap();
    assert!(node.registry.peer("p1").await.unwrap().is_some());

    let mut events = node.registry.subscribe_restart_tunnel().await.unwrap();
    client.deauthorize_peer("p1").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .expect("restart event within a second");
    assert!(event.is_some());

    assert!(node.registry.peer("p1").await.unwrap().is_none());
    assert!(!node.registry.is_authorized("p1").await.unwrap());
    let ips = node.registry.local().hgetall("trellis:peerips").await.unwrap();
    assert!(!ips.contains_key("p1"), "released IP is gone from the map");

    // a fresh connect is rejected again
    let err = client.connect("p1", "one").await.unwrap_err();
    assert_eq!(err.code(), Some(codes::ACCESS_DENIED));
}

// ---------------------------------------------------------------------------
// 4. Second node joins
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_node_join_assigns_disjoint_subnet() {
    let shared = MemoryStore::new();
    let a = start_node("a", &shared, None, true).await;
    let (addr, _guard) = spawn_rpc(&a).await;

    let b = start_node("bb", &shared, Some(addr.to_string()), true).await;

    assert_eq!(b.controller.current_role(), Role::Replica);
    let subnet = b.registry.node_subnet("bb").await.unwrap().unwrap();
    assert_eq!(subnet.to_string(), "10.10.1.0/24");
    assert_eq!(
        b.registry.gateway_ip("bb").await.unwrap().unwrap().to_string(),
        "10.10.1.1"
    );

    // the joiner rendered its tunnel during bootstrap
    assert!(b.restarts.load(Ordering::SeqCst) >= 1);
    let config = std::fs::read_to_string(b._dir.path().join("wg/trellis0.conf")).unwrap();
    assert!(config.contains("# a\n[Peer]"));
    assert!(config.contains(&format!("Endpoint = {}:51820", a.cfg.endpoint_ip)));
    assert!(config.contains("PersistentKeepalive = 25"));
    assert!(!config.contains("# bb\n[Peer]"), "self is omitted");
}

#[tokio::test]
async fn test_join_rejects_wrong_cluster_key() {
    let shared = MemoryStore::new();
    let a = start_node("a", &shared, None, true).await;
    let (addr, _guard) = spawn_rpc(&a).await;

    let err = client(addr)
        .join(&JoinRequest {
            id: "evil".to_string(),
            name: "evil".to_string(),
            cluster_key: "wrong".to_string(),
            addr: "127.0.0.1:9999".to_string(),
            endpoint_ip: "203.0.113.99".to_string(),
            endpoint_port: 51820,
            interface_name: "trellis0".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::INVALID_AUTH));
    assert!(shared.get("trellis:nodes:evil").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// 5. Routes flow into the owner's peer record
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_route_lands_in_allowed_ips_within_one_tick() {
    let shared = MemoryStore::new();
    let node = start_node("a", &shared, None, true).await;
    let (addr, _guard) = spawn_rpc(&node).await;
    let client = client(addr);

    client.create_route("a", "192.168.7.0/24").await.unwrap();
    node.updater.run_once().await.unwrap();

    let peer = node.registry.peer("a").await.unwrap().unwrap();
    assert!(peer.allowed_ips.contains(&"192.168.7.0/24".to_string()));

    client.delete_route("192.168.7.0/24").await.unwrap();
    node.updater.run_once().await.unwrap();
    let peer = node.registry.peer("a").await.unwrap().unwrap();
    assert!(!peer.allowed_ips.contains(&"192.168.7.0/24".to_string()));
}

#[tokio::test]
async fn test_route_validation() {
    let shared = MemoryStore::new();
    let node = start_node("a", &shared, None, true).await;
    let (addr, _guard) = spawn_rpc(&node).await;
    let client = client(addr);

    let err = client
        .create_route("ghost", "192.168.7.0/24")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::NODE_NOT_FOUND));

    client.create_route("a", "192.168.7.0/24").await.unwrap();
    let err = client
        .create_route("a", "192.168.7.0/24")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::ROUTE_EXISTS));

    let routes = client.routes().await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].network, "192.168.7.0/24");
}

// ---------------------------------------------------------------------------
// 6. Failover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failover_promotes_surviving_node() {
    let shared = MemoryStore::new();
    let a = start_node("a", &shared, None, true).await;
    let (addr_a, _guard_a) = spawn_rpc(&a).await;
    let b = start_node("bb", &shared, Some(addr_a.to_string()), true).await;

    // kill the primary: its loops stop and its descriptor lapses
    a.controller.stop();
    shared.del("trellis:master").await.unwrap();

    // make the survivor the freshest node record
    b.controller.update_local_node().await.unwrap();

    let promoted = b.controller.monitor_tick().await.unwrap();
    assert!(promoted, "surviving node takes the primary role");
    assert_eq!(b.controller.current_role(), Role::Primary);

    let master = b.registry.master().await.unwrap().unwrap();
    assert_eq!(master.id, "bb");
    assert_eq!(master.gateway_ip, "10.10.1.1");

    // a new join against the promoted node succeeds
    let (addr_b, _guard_b) = spawn_rpc(&b).await;
    let resp = client(addr_b)
        .join(&JoinRequest {
            id: "ccc".to_string(),
            name: "ccc".to_string(),
            cluster_key: "test-cluster-key".to_string(),
            addr: "127.0.0.1:9300".to_string(),
            endpoint_ip: "203.0.113.30".to_string(),
            endpoint_port: 51820,
            interface_name: "trellis0".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(resp.master.id, "bb");
    assert_eq!(resp.node.gateway_ip, "10.10.2.1");
}

#[tokio::test]
async fn test_monitor_defers_to_fresher_candidate() {
    let shared = MemoryStore::new();
    let a = start_node("a", &shared, None, true).await;
    let b = start_node("bb", &shared, None, true).await;
    assert_eq!(b.controller.current_role(), Role::Replica);

    shared.del("trellis:master").await.unwrap();

    // hand the freshest record to the other node: this monitor must wait
    let node = trellis_proto::Node {
        updated_at: trellis_server::registry::now_secs() + 60,
        ..a.registry.node("a").await.unwrap().unwrap()
    };
    a.registry.put_node(&node, NODE_HEARTBEAT_EXPIRY).await.unwrap();

    let promoted = b.controller.monitor_tick().await.unwrap();
    assert!(!promoted, "node defers while another candidate is fresher");
    assert_eq!(b.controller.current_role(), Role::Replica);
}

// ---------------------------------------------------------------------------
// Tunnel convergence across nodes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cluster_renders_converge() {
    let shared = MemoryStore::new();
    let a = start_node("a", &shared, None, true).await;
    let (addr, _guard) = spawn_rpc(&a).await;
    let b = start_node("bb", &shared, Some(addr.to_string()), true).await;

    // another updater pass on both sides with identical state
    a.updater.run_once().await.unwrap();
    b.updater.run_once().await.unwrap();

    let peers = a.registry.peers().await.unwrap();
    let ids: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "bb"]);

    // both nodes agree on what the cluster looks like; each renders the
    // other as its peer
    let others = |own: &str| -> Vec<Peer> {
        peers.iter().filter(|p| p.id != own).cloned().collect()
    };
    let render = |own: &str, address: &str, key: &str| {
        render_node(&NodeConfigSpec {
            interface: "trellis0",
            underlay_interface: "eth0",
            private_key: key,
            listen_port: 51820,
            address,
            peers: &others(own),
        })
    };
    let a_config = render("a", "10.10.0.1/24", "ka");
    assert!(a_config.contains("# bb\n[Peer]"));
    assert!(!a_config.contains("# a\n[Peer]"));
    let b_config = render("bb", "10.10.1.1/24", "kb");
    assert!(b_config.contains("# a\n[Peer]"));

    // stable state: further passes do not touch the tunnel again
    let before_a = a.restarts.load(Ordering::SeqCst);
    a.updater.run_once().await.unwrap();
    assert_eq!(a.restarts.load(Ordering::SeqCst), before_a);
}
