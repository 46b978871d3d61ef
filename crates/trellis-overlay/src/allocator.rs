//! Peer IP allocation within the peer network
//!
//! Addresses are scanned upward from the first host of the network.
//! `.0`, `.1`, and `.255` are skipped in every /24 block: `.0` and `.255`
//! collide with network/broadcast conventions and `.1` is reserved for
//! gateways. Already-assigned values are skipped; an exhausted range is an
//! explicit error.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{OverlayError, Result};

/// Whether an address may be handed out to a peer
pub fn assignable(ip: Ipv4Addr) -> bool {
    !matches!(ip.octets()[3], 0 | 1 | 255)
}

/// First free assignable address in the network
pub fn next_free(network: Ipv4Net, in_use: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    for ip in network.hosts() {
        if !assignable(ip) {
            continue;
        }
        if in_use.contains(&ip) {
            continue;
        }
        return Ok(ip);
    }
    Err(OverlayError::Exhausted(network.to_string()))
}
