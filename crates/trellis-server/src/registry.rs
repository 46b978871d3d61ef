//! Typed CRUD over the replicated store
//!
//! Reads go against the local store instance; writes go through the
//! swappable writable handle so they always land on the current primary.
//! Records are JSON. Listings are sorted by ID so callers see a stable
//! order regardless of the store's key enumeration.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::debug;

use trellis_overlay::{allocator, keys, subnets};
use trellis_proto::{KeyPair, Master, Node, Peer, Route};
use trellis_store::{EventStream, KvStore, StoreHandle};

use crate::error::Result;
use crate::keyspace;

/// Typed access to cluster state
pub struct Registry {
    local: Arc<dyn KvStore>,
    writable: StoreHandle,
}

impl Registry {
    pub fn new(local: Arc<dyn KvStore>, writable: StoreHandle) -> Self {
        Self { local, writable }
    }

    /// The local (read) store
    pub fn local(&self) -> Arc<dyn KvStore> {
        self.local.clone()
    }

    /// The writable-store handle
    pub fn writable(&self) -> &StoreHandle {
        &self.writable
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.local.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_all<T: serde::de::DeserializeOwned>(&self, pattern: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for key in self.local.keys(pattern).await? {
            // a record can lapse between KEYS and GET; skip the hole
            if let Some(record) = self.read_json(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Primary descriptor and cluster secret
    // ------------------------------------------------------------------

    /// Current primary descriptor, if one is alive
    pub async fn master(&self) -> Result<Option<Master>> {
        self.read_json(&keyspace::master()).await
    }

    /// Write the primary descriptor with the given TTL
    pub async fn set_master(&self, master: &Master, ttl: std::time::Duration) -> Result<()> {
        let bytes = serde_json::to_vec(master)?;
        self.writable
            .current()
            .set_with_ttl(&keyspace::master(), &bytes, ttl)
            .await?;
        Ok(())
    }

    /// Stored cluster secret
    pub async fn cluster_key(&self) -> Result<Option<String>> {
        Ok(self
            .local
            .get(&keyspace::cluster_key())
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Re-write the cluster secret
    pub async fn set_cluster_key(&self, key: &str) -> Result<()> {
        self.writable
            .current()
            .set(&keyspace::cluster_key(), key.as_bytes())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub async fn node(&self, id: &str) -> Result<Option<Node>> {
        self.read_json(&keyspace::node(id)).await
    }

    /// All live node records, sorted by ID
    pub async fn nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.read_all(&keyspace::nodes_pattern()).await?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    pub async fn put_node(&self, node: &Node, ttl: std::time::Duration) -> Result<()> {
        let bytes = serde_json::to_vec(node)?;
        self.writable
            .current()
            .set_with_ttl(&keyspace::node(&node.id), &bytes, ttl)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node subnets
    // ------------------------------------------------------------------

    /// Subnet assigned to the node, if any
    pub async fn node_subnet(&self, id: &str) -> Result<Option<Ipv4Net>> {
        match self.local.get(&keyspace::node_network(id)).await? {
            Some(bytes) => {
                let cidr = String::from_utf8_lossy(&bytes);
                Ok(Some(subnets::parse_cidr(&cidr)?))
            }
            None => Ok(None),
        }
    }

    /// Assigned subnet for the node, carving a fresh one when absent
    ///
    /// Assignments are immutable once persisted.
    pub async fn ensure_node_subnet(&self, id: &str, node_network: Ipv4Net) -> Result<Ipv4Net> {
        if let Some(existing) = self.node_subnet(id).await? {
            return Ok(existing);
        }

        let mut assigned = HashSet::new();
        for key in self.local.keys(&keyspace::node_networks_pattern()).await? {
            if let Some(bytes) = self.local.get(&key).await? {
                assigned.insert(String::from_utf8_lossy(&bytes).into_owned());
            }
        }

        let subnet = subnets::carve(node_network, &assigned)?;
        debug!(node = id, subnet = %subnet, "allocated node subnet");
        self.writable
            .current()
            .set(&keyspace::node_network(id), subnet.to_string().as_bytes())
            .await?;
        Ok(subnet)
    }

    /// Overlay gateway IP of the node, if its subnet is assigned
    pub async fn gateway_ip(&self, id: &str) -> Result<Option<Ipv4Addr>> {
        match self.node_subnet(id).await? {
            Some(subnet) => Ok(Some(subnets::gateway_ip(subnet)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Keypairs
    // ------------------------------------------------------------------

    /// Persistent keypair for the ID, generated on first use
    pub async fn get_or_create_keypair(&self, id: &str) -> Result<KeyPair> {
        if let Some(pair) = self.read_json(&keyspace::keypair(id)).await? {
            return Ok(pair);
        }
        debug!(id, "generating keypair");
        let pair = keys::generate_keypair();
        let bytes = serde_json::to_vec(&pair)?;
        self.writable
            .current()
            .set(&keyspace::keypair(id), &bytes)
            .await?;
        Ok(pair)
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Peer record with its allocated IP joined in
    pub async fn peer(&self, id: &str) -> Result<Option<Peer>> {
        let Some(mut peer) = self.read_json::<Peer>(&keyspace::peer(id)).await? else {
            return Ok(None);
        };
        let ips = self.local.hgetall(&keyspace::peer_ips()).await?;
        if let Some(ip) = ips.get(&peer.id) {
            peer.peer_ip = ip.clone();
        }
        Ok(Some(peer))
    }

    /// All peer records with allocated IPs joined in, sorted by ID
    pub async fn peers(&self) -> Result<Vec<Peer>> {
        let mut peers: Vec<Peer> = self.read_all(&keyspace::peers_pattern()).await?;
        let ips = self.local.hgetall(&keyspace::peer_ips()).await?;
        for peer in &mut peers {
            if let Some(ip) = ips.get(&peer.id) {
                peer.peer_ip = ip.clone();
            }
        }
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    pub async fn put_peer(&self, peer: &Peer) -> Result<()> {
        let bytes = serde_json::to_vec(peer)?;
        self.writable
            .current()
            .set(&keyspace::peer(&peer.id), &bytes)
            .await?;
        Ok(())
    }

    pub async fn delete_peer(&self, id: &str) -> Result<()> {
        self.writable.current().del(&keyspace::peer(id)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer IPs
    // ------------------------------------------------------------------

    /// Allocated IP for the peer, assigning the first free address when
    /// absent
    pub async fn ensure_peer_ip(&self, id: &str, peer_network: Ipv4Net) -> Result<Ipv4Addr> {
        let assigned = self.local.hgetall(&keyspace::peer_ips()).await?;
        if let Some(ip) = assigned.get(id) {
            return Ok(ip.parse().map_err(|_| {
                crate::error::ServerError::Config(format!("corrupt peer IP entry for {id}: {ip}"))
            })?);
        }

        let in_use: HashSet<Ipv4Addr> = assigned
            .values()
            .filter_map(|ip| ip.parse().ok())
            .collect();
        let ip = allocator::next_free(peer_network, &in_use)?;
        debug!(peer = id, %ip, "allocated peer IP");
        self.writable
            .current()
            .hset(&keyspace::peer_ips(), id, &ip.to_string())
            .await?;
        Ok(ip)
    }

    /// Release the peer's IP back to the pool
    pub async fn release_peer_ip(&self, id: &str) -> Result<()> {
        self.writable
            .current()
            .hdel(&keyspace::peer_ips(), id)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    pub async fn route(&self, network: &str) -> Result<Option<Route>> {
        self.read_json(&keyspace::route(network)).await
    }

    /// All routes, sorted by network
    pub async fn routes(&self) -> Result<Vec<Route>> {
        let mut routes: Vec<Route> = self.read_all(&keyspace::routes_pattern()).await?;
        routes.sort_by(|a, b| a.network.cmp(&b.network));
        Ok(routes)
    }

    pub async fn put_route(&self, route: &Route) -> Result<()> {
        let bytes = serde_json::to_vec(route)?;
        self.writable
            .current()
            .set(&keyspace::route(&route.network), &bytes)
            .await?;
        Ok(())
    }

    pub async fn delete_route(&self, network: &str) -> Result<()> {
        self.writable.current().del(&keyspace::route(network)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Authorised peers
    // ------------------------------------------------------------------

    pub async fn is_authorized(&self, id: &str) -> Result<bool> {
        Ok(self
            .local
            .smembers(&keyspace::authorized_peers())
            .await?
            .iter()
            .any(|member| member == id))
    }

    /// Authorised peer IDs, sorted
    pub async fn authorized_peers(&self) -> Result<Vec<String>> {
        let mut ids = self.local.smembers(&keyspace::authorized_peers()).await?;
        ids.sort();
        Ok(ids)
    }

    pub async fn authorize_peer(&self, id: &str) -> Result<()> {
        self.writable
            .current()
            .sadd(&keyspace::authorized_peers(), id)
            .await?;
        Ok(())
    }

    pub async fn deauthorize_peer(&self, id: &str) -> Result<()> {
        self.writable
            .current()
            .srem(&keyspace::authorized_peers(), id)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Tell every node to rebuild its tunnel configuration
    pub async fn publish_restart_tunnel(&self) -> Result<()> {
        self.writable
            .current()
            .publish(&keyspace::restart_tunnel_channel(), b"restart")
            .await?;
        Ok(())
    }

    /// Subscribe to tunnel-restart events on the local store
    pub async fn subscribe_restart_tunnel(&self) -> Result<EventStream> {
        Ok(self
            .local
            .subscribe(&keyspace::restart_tunnel_channel())
            .await?)
    }
}

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
