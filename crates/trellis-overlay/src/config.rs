//! Deterministic tunnel configuration rendering
//!
//! Two variants: the node config (forwarding and masquerade rules, one
//! `[Peer]` block per other participant) and the client peer config (DNS
//! clause, one `[Peer]` block per node). Rendering is a pure function of
//! the snapshot; peers are ordered by ID so the same snapshot always
//! produces byte-identical output regardless of store listing order.

use trellis_proto::Peer;

/// Keepalive interval written for node-backed peers, to hold NAT state
pub const KEEPALIVE_SECS: u16 = 25;

/// Inputs for the node-variant configuration
#[derive(Debug, Clone)]
pub struct NodeConfigSpec<'a> {
    /// Tunnel interface name (used in the forwarding rules)
    pub interface: &'a str,
    /// Underlay ethernet interface masqueraded out of
    pub underlay_interface: &'a str,
    /// This node's private key
    pub private_key: &'a str,
    /// Tunnel listen port
    pub listen_port: u16,
    /// Gateway address with subnet prefix (e.g. `10.10.0.1/24`)
    pub address: &'a str,
    /// All peers except this node
    pub peers: &'a [Peer],
}

/// Inputs for the client-peer-variant configuration
#[derive(Debug, Clone)]
pub struct PeerConfigSpec<'a> {
    /// This peer's private key
    pub private_key: &'a str,
    /// Allocated address with prefix (e.g. `10.51.0.2/16`)
    pub address: &'a str,
    /// Node gateway IPs used as resolvers
    pub dns: &'a [String],
    /// Peer list from the node; only node-backed entries are emitted
    pub peers: &'a [Peer],
}

/// Render the node-variant configuration
pub fn render_node(spec: &NodeConfigSpec) -> String {
    let mut out = String::new();
    out.push_str("# managed by trellisd\n[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", spec.private_key));
    out.push_str(&format!("ListenPort = {}\n", spec.listen_port));
    out.push_str(&format!("Address = {}\n", spec.address));
    out.push_str(&format!(
        "PostUp = {}\n",
        forwarding_rules("-A", spec.interface, spec.underlay_interface)
    ));
    out.push_str(&format!(
        "PostDown = {}\n",
        forwarding_rules("-D", spec.interface, spec.underlay_interface)
    ));

    for peer in sorted(spec.peers) {
        push_peer_block(&mut out, peer, true);
    }
    out
}

/// Render the client-peer-variant configuration
pub fn render_peer(spec: &PeerConfigSpec) -> String {
    let mut out = String::new();
    out.push_str("# managed by trellis-peer\n[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", spec.private_key));
    out.push_str(&format!("Address = {}\n", spec.address));
    out.push_str(&format!("DNS = {}\n", spec.dns.join(", ")));

    for peer in sorted(spec.peers) {
        if peer.is_node() {
            push_peer_block(&mut out, peer, false);
        }
    }
    out
}

fn sorted(peers: &[Peer]) -> Vec<&Peer> {
    let mut list: Vec<&Peer> = peers.iter().collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    list
}

fn push_peer_block(out: &mut String, peer: &Peer, keepalive: bool) {
    out.push_str(&format!("\n# {}\n[Peer]\n", peer.id));
    out.push_str(&format!("PublicKey = {}\n", peer.key_pair.public_key));
    if !peer.allowed_ips.is_empty() {
        out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips.join(", ")));
    }
    if peer.is_node() {
        out.push_str(&format!("Endpoint = {}\n", peer.endpoint));
        if keepalive {
            out.push_str(&format!("PersistentKeepalive = {KEEPALIVE_SECS}\n"));
        }
    }
}

fn forwarding_rules(flag: &str, interface: &str, underlay: &str) -> String {
    format!(
        "iptables {flag} FORWARD -i {interface} -j ACCEPT; \
         iptables -t nat {flag} POSTROUTING -o {underlay} -j MASQUERADE; \
         ip6tables {flag} FORWARD -i {interface} -j ACCEPT; \
         ip6tables -t nat {flag} POSTROUTING -o {underlay} -j MASQUERADE"
    )
}
