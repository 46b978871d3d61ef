//! Node-subnet carving
//!
//! Each node receives a fixed-prefix sub-CIDR out of the configured node
//! network. Candidates are walked in address order from the first aligned
//! sub-block; the first whose canonical string is not already assigned
//! wins. Assignments are immutable once persisted, so the walk is stable
//! across the cluster.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{OverlayError, Result};

/// Prefix length of the per-node sub-CIDR
pub const NODE_SUBNET_PREFIX: u8 = 24;

/// Parse a CIDR string
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map_err(|e| OverlayError::InvalidCidr(format!("{cidr}: {e}")))
}

/// Pick the first free sub-CIDR of the node network
///
/// `assigned` holds the canonical CIDR strings already persisted for other
/// nodes.
pub fn carve(node_network: Ipv4Net, assigned: &HashSet<String>) -> Result<Ipv4Net> {
    let candidates = node_network
        .subnets(NODE_SUBNET_PREFIX)
        .map_err(|e| OverlayError::InvalidCidr(format!("{node_network}: {e}")))?;

    for candidate in candidates {
        if !assigned.contains(&candidate.to_string()) {
            return Ok(candidate);
        }
    }
    Err(OverlayError::SubnetsExhausted(node_network.to_string()))
}

/// Overlay gateway IP of a node subnet: its first host address
pub fn gateway_ip(subnet: Ipv4Net) -> Result<Ipv4Addr> {
    subnet
        .hosts()
        .next()
        .ok_or_else(|| OverlayError::Exhausted(subnet.to_string()))
}

/// Gateway address with the subnet prefix, as written into the
/// `[Interface]` section (e.g. `10.10.0.1/24`)
pub fn gateway_address(subnet: Ipv4Net) -> Result<String> {
    Ok(format!("{}/{}", gateway_ip(subnet)?, subnet.prefix_len()))
}
