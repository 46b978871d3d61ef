//! Node configuration and loop intervals

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;

/// Interval of the primary-descriptor heartbeat; also its TTL, so a dead
/// primary's descriptor lapses within one missed beat
pub const MASTER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Interval of the node-record heartbeat
pub const NODE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// TTL of node records
pub const NODE_HEARTBEAT_EXPIRY: Duration = Duration::from_secs(86_400);

/// Interval of the peer-updater loop
pub const PEER_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// How long a joiner waits for its replication link to come up
pub const REPLICATION_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of a cluster node
#[derive(Debug, Clone)]
pub struct Config {
    /// Node ID; stable across restarts
    pub id: String,
    /// Node name, resolvable through the overlay DNS
    pub name: String,
    /// Directory for the embedded store and other node state
    pub data_dir: PathBuf,
    /// Listen port of the embedded store
    pub store_port: u16,
    /// RPC bind address
    pub bind_addr: SocketAddr,
    /// RPC address advertised to the cluster
    pub advertise_addr: String,
    /// Seed node to join through; absent on the first node
    pub seed_addr: Option<String>,
    /// Pre-shared cluster key required on join
    pub cluster_key: String,
    /// Network carved into per-node subnets
    pub node_network: Ipv4Net,
    /// Network peer IPs are allocated from
    pub peer_network: Ipv4Net,
    /// Underlay IP the tunnel endpoint is reachable at
    pub endpoint_ip: String,
    /// Underlay port the tunnel listens on
    pub endpoint_port: u16,
    /// DNS resolver listen address
    pub dns_listen: SocketAddr,
    /// Upstream resolver for names outside the overlay
    pub dns_upstream: SocketAddr,
    /// Tunnel interface name
    pub interface_name: String,
    /// Underlay ethernet interface masqueraded out of
    pub underlay_interface: String,
    /// Directory the tunnel config file is written into
    pub config_dir: PathBuf,
    /// Peer IDs authorised on first primary start
    pub authorized_peers: Vec<String>,
    /// PEM client identity presented on outbound RPC
    pub tls_identity: Option<PathBuf>,
    /// Disable TLS certificate verification on outbound RPC
    pub tls_skip_verify: bool,
}

impl Config {
    /// Store URL other cluster members reach this node's store at, once
    /// the overlay is up
    pub fn advertised_store_url(&self, gateway_ip: &str) -> String {
        format!("redis://{}:{}", gateway_ip, self.store_port)
    }

    /// The `host:port` tunnel endpoint of this node
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.endpoint_ip, self.endpoint_port)
    }
}

/// Baseline configuration for unit tests
#[cfg(test)]
pub(crate) fn test_config(id: &str) -> Config {
    Config {
        id: id.to_string(),
        name: id.to_string(),
        data_dir: PathBuf::from("/tmp/trellis-test"),
        store_port: 6379,
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        advertise_addr: "127.0.0.1:9000".to_string(),
        seed_addr: None,
        cluster_key: "secret".to_string(),
        node_network: "10.10.0.0/16".parse().unwrap(),
        peer_network: "10.51.0.0/16".parse().unwrap(),
        endpoint_ip: "203.0.113.10".to_string(),
        endpoint_port: 51820,
        dns_listen: "127.0.0.1:0".parse().unwrap(),
        dns_upstream: "1.1.1.1:53".parse().unwrap(),
        interface_name: "trellis0".to_string(),
        underlay_interface: "eth0".to_string(),
        config_dir: PathBuf::from("/tmp/trellis-test/wg"),
        authorized_peers: Vec::new(),
        tls_identity: None,
        tls_skip_verify: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_store_url() {
        let cfg = test_config("a");
        assert_eq!(
            cfg.advertised_store_url("10.10.0.1"),
            "redis://10.10.0.1:6379"
        );
        assert_eq!(cfg.endpoint(), "203.0.113.10:51820");
    }
}
