//! RPC request/response bodies and the error envelope
//!
//! One request/response pair per control-plane operation. Errors travel as
//! an [`ErrorBody`] with a stable string code; the codes are part of the
//! protocol contract and are matched by name on the client side.

use crate::types::{KeyPair, Master, Node, Peer, Route};
use serde::{Deserialize, Serialize};

/// Stable protocol error codes
pub mod codes {
    /// Cluster key mismatch on `Join`
    pub const INVALID_AUTH: &str = "invalid-auth";
    /// Primary descriptor absent; caller should retry
    pub const NO_PRIMARY: &str = "no-primary";
    /// Unauthorised peer `Connect`
    pub const ACCESS_DENIED: &str = "access-denied";
    /// Requested route is already reserved
    pub const ROUTE_EXISTS: &str = "route-exists";
    /// Referenced node does not exist
    pub const NODE_NOT_FOUND: &str = "node-not-found";
    /// Replicated store unreachable
    pub const KV_UNAVAILABLE: &str = "kv-unavailable";
    /// No free address left in the peer network
    pub const EXHAUSTED: &str = "exhausted";
}

/// Error envelope returned for any non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code (see [`codes`])
    pub code: String,
    /// Human-readable detail
    pub message: String,
}

/// `Join` request: a node joining the cluster through a seed node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub name: String,
    pub cluster_key: String,
    pub addr: String,
    pub endpoint_ip: String,
    pub endpoint_port: u16,
    pub interface_name: String,
}

/// `Join` response: everything the joiner needs to bring its tunnel up
/// before the replicated store is reachable over the overlay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub master: Master,
    pub node: Node,
    pub peers: Vec<Peer>,
}

/// `Connect` request: a client peer syncing through any node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub id: String,
    pub name: String,
}

/// `Connect` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub key_pair: KeyPair,
    /// Allocated overlay address as `ip/prefix`
    pub address: String,
    /// Current peer list, minus the caller
    pub peers: Vec<Peer>,
    /// Gateway IPs of all nodes, for the peer's DNS clause
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizePeerRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeauthorizePeerRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedPeersResponse {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRouteRequest {
    pub node_id: String,
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRouteRequest {
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesResponse {
    pub routes: Vec<Route>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_roundtrip() {
        let body = ErrorBody {
            code: codes::NO_PRIMARY.to_string(),
            message: "no configured master".to_string(),
        };
        let json = serde_json::to_string(&body).unwrap();
        let parsed: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.code, "no-primary");
    }

    #[test]
    fn test_join_request_fields() {
        let req = JoinRequest {
            id: "b".to_string(),
            name: "beta".to_string(),
            cluster_key: "secret".to_string(),
            addr: "203.0.113.11:9000".to_string(),
            endpoint_ip: "203.0.113.11".to_string(),
            endpoint_port: 51820,
            interface_name: "trellis0".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cluster_key"], "secret");
        assert_eq!(json["endpoint_port"], 51820);
    }
}
