//! Replicated records shared across the cluster
//!
//! Every record is stored as JSON in the replicated key-value store and
//! travels unchanged through the RPC surface.

use serde::{Deserialize, Serialize};

/// Tunnel keypair for a node or peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Base64-encoded private key
    pub private_key: String,
    /// Base64-encoded public key
    pub public_key: String,
}

/// Descriptor of the current writable primary
///
/// Written with a short TTL by the primary heartbeat; its absence triggers
/// re-election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Master {
    /// Node ID of the primary
    pub id: String,
    /// RPC address of the primary
    pub addr: String,
    /// Store URL joiners rebind their replication onto (overlay address)
    pub store_url: String,
    /// Overlay gateway IP of the primary
    pub gateway_ip: String,
}

/// A cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID
    pub id: String,
    /// Node name, resolvable through the overlay DNS
    pub name: String,
    /// RPC address
    pub addr: String,
    /// Tunnel keypair
    pub key_pair: KeyPair,
    /// Underlay IP the tunnel endpoint is reachable at
    pub endpoint_ip: String,
    /// Underlay port the tunnel endpoint listens on
    pub endpoint_port: u16,
    /// Overlay gateway IP (first host of the node subnet)
    pub gateway_ip: String,
    /// Tunnel interface name
    pub interface_name: String,
    /// Unix seconds of the last heartbeat write
    pub updated_at: u64,
}

impl Node {
    /// The `host:port` tunnel endpoint of this node on the underlay
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.endpoint_ip, self.endpoint_port)
    }
}

/// A tunnel participant
///
/// Every node is a peer; not every peer is a node. `endpoint` is non-empty
/// iff the peer is a node. `peer_ip` is joined in from the peer-IP
/// allocation on read and is empty for nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer ID
    pub id: String,
    /// Peer name, resolvable through the overlay DNS
    pub name: String,
    /// Tunnel keypair
    pub key_pair: KeyPair,
    /// Networks reachable through this peer
    pub allowed_ips: Vec<String>,
    /// Underlay `host:port`; empty for non-node peers
    #[serde(default)]
    pub endpoint: String,
    /// Allocated overlay IP; empty for nodes
    #[serde(default)]
    pub peer_ip: String,
}

impl Peer {
    /// Whether this peer is a cluster node
    pub fn is_node(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

/// An additional network advertised as reachable through a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Owning node ID
    pub node_id: String,
    /// Advertised CIDR
    pub network: String,
}
