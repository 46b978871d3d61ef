//! Store key layout
//!
//! All cluster state lives under the `trellis:` namespace with
//! colon-delimited keys. Key construction is centralized here so the
//! layout is visible in one place.

/// Namespace prefix of every key
pub const NAMESPACE: &str = "trellis";

/// Primary descriptor (TTL-bound)
pub fn master() -> String {
    format!("{NAMESPACE}:master")
}

/// Pre-shared cluster key
pub fn cluster_key() -> String {
    format!("{NAMESPACE}:key")
}

/// Node record
pub fn node(id: &str) -> String {
    format!("{NAMESPACE}:nodes:{id}")
}

/// Prefix pattern matching all node records
pub fn nodes_pattern() -> String {
    format!("{NAMESPACE}:nodes:*")
}

/// Node subnet assignment
pub fn node_network(id: &str) -> String {
    format!("{NAMESPACE}:nodenetworks:{id}")
}

/// Prefix pattern matching all node subnet assignments
pub fn node_networks_pattern() -> String {
    format!("{NAMESPACE}:nodenetworks:*")
}

/// Peer record
pub fn peer(id: &str) -> String {
    format!("{NAMESPACE}:peers:{id}")
}

/// Prefix pattern matching all peer records
pub fn peers_pattern() -> String {
    format!("{NAMESPACE}:peers:*")
}

/// Hash of peer-IP assignments (id to ip)
pub fn peer_ips() -> String {
    format!("{NAMESPACE}:peerips")
}

/// Persistent keypair
pub fn keypair(id: &str) -> String {
    format!("{NAMESPACE}:keypairs:{id}")
}

/// Route reservation
pub fn route(network: &str) -> String {
    format!("{NAMESPACE}:routes:{network}")
}

/// Prefix pattern matching all route reservations
pub fn routes_pattern() -> String {
    format!("{NAMESPACE}:routes:*")
}

/// Set of authorised peer IDs
pub fn authorized_peers() -> String {
    format!("{NAMESPACE}:authorized")
}

/// Pub/sub channel carrying tunnel-restart events
pub fn restart_tunnel_channel() -> String {
    format!("{NAMESPACE}:events:restart-tunnel")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(master(), "trellis:master");
        assert_eq!(cluster_key(), "trellis:key");
        assert_eq!(node("a"), "trellis:nodes:a");
        assert_eq!(nodes_pattern(), "trellis:nodes:*");
        assert_eq!(node_network("a"), "trellis:nodenetworks:a");
        assert_eq!(peer("p1"), "trellis:peers:p1");
        assert_eq!(peer_ips(), "trellis:peerips");
        assert_eq!(keypair("p1"), "trellis:keypairs:p1");
        assert_eq!(route("192.168.7.0/24"), "trellis:routes:192.168.7.0/24");
        assert_eq!(authorized_peers(), "trellis:authorized");
        assert_eq!(restart_tunnel_channel(), "trellis:events:restart-tunnel");
    }
}
