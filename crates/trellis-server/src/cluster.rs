//! Cluster controller
//!
//! Owns the node's role in the cluster: joining through a seed, the
//! two-phase bootstrap that rebinds store replication onto the overlay,
//! primary and node heartbeats, and the replica monitor that re-elects a
//! primary when the descriptor lapses.
//!
//! The bootstrap ordering is deliberate and must not be collapsed: the
//! join response (not the store) supplies the peers for the first tunnel
//! render, the primary's gateway must answer over the tunnel before
//! replication is pointed at its overlay address, and the replication
//! link must report up before any dependent operation runs.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use futures::StreamExt;
use trellis_overlay::config::{render_node, NodeConfigSpec};
use trellis_overlay::probe::{ReachabilityProbe, DEFAULT_PROBE_DEADLINE};
use trellis_overlay::{subnets, TunnelManager};
use trellis_proto::{Client, JoinRequest, Master, Node, Peer};
use trellis_store::{ReplicationControl, StoreConnector};

use crate::config::{
    Config, MASTER_HEARTBEAT_INTERVAL, NODE_HEARTBEAT_EXPIRY, NODE_HEARTBEAT_INTERVAL,
    REPLICATION_SYNC_TIMEOUT,
};
use crate::error::{Result, ServerError};
use crate::registry::{now_secs, Registry};
use crate::updater::Updater;

/// Role of this node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Calling `Join` on the seed
    Joining,
    /// Tunnel up, waiting to rebind the store onto the overlay
    Bootstrapping,
    /// The single writable store instance
    Primary,
    /// Read-only follower
    Replica,
    /// Shut down
    Stopped,
}

/// The cluster controller
pub struct Controller {
    cfg: Arc<Config>,
    registry: Arc<Registry>,
    replication: Arc<dyn ReplicationControl>,
    connector: Arc<dyn StoreConnector>,
    tunnel: Arc<TunnelManager>,
    probe: Arc<dyn ReachabilityProbe>,
    role: watch::Sender<Role>,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<Registry>,
        replication: Arc<dyn ReplicationControl>,
        connector: Arc<dyn StoreConnector>,
        tunnel: Arc<TunnelManager>,
        probe: Arc<dyn ReachabilityProbe>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (role, _) = watch::channel(Role::Joining);
        Arc::new(Self {
            cfg,
            registry,
            replication,
            connector,
            tunnel,
            probe,
            role,
            cancel,
        })
    }

    /// Watch the node's role
    pub fn role(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    /// Current role
    pub fn current_role(&self) -> Role {
        *self.role.borrow()
    }

    /// Cancel every controller loop
    pub fn stop(&self) {
        self.role.send_replace(Role::Stopped);
        self.cancel.cancel();
    }

    /// Enter the cluster: join through the seed when one is configured,
    /// otherwise assume or follow the existing primary
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.cfg.seed_addr.clone() {
            Some(seed) => self.join_cluster(&seed).await,
            None => self.configure_node().await,
        }
    }

    // ------------------------------------------------------------------
    // Join / bootstrap
    // ------------------------------------------------------------------

    async fn join_cluster(self: &Arc<Self>, seed: &str) -> Result<()> {
        self.role.send_replace(Role::Joining);
        info!(seed, "joining cluster");

        let client = self.build_client(seed)?;
        let resp = client
            .join(&JoinRequest {
                id: self.cfg.id.clone(),
                name: self.cfg.name.clone(),
                cluster_key: self.cfg.cluster_key.clone(),
                addr: self.cfg.advertise_addr.clone(),
                endpoint_ip: self.cfg.endpoint_ip.clone(),
                endpoint_port: self.cfg.endpoint_port,
                interface_name: self.cfg.interface_name.clone(),
            })
            .await?;

        info!(
            master = %resp.master.id,
            subnet_gateway = %resp.node.gateway_ip,
            peers = resp.peers.len(),
            "join accepted"
        );
        self.role.send_replace(Role::Bootstrapping);

        // phase one: bring the tunnel up from the join response alone;
        // the primary's store is not reachable until this succeeds
        let peers: Vec<Peer> = resp
            .peers
            .iter()
            .filter(|p| p.id != self.cfg.id)
            .cloned()
            .collect();
        let address = format!("{}/{}", resp.node.gateway_ip, subnets::NODE_SUBNET_PREFIX);
        let rendered = render_node(&NodeConfigSpec {
            interface: &self.cfg.interface_name,
            underlay_interface: &self.cfg.underlay_interface,
            private_key: &resp.node.key_pair.private_key,
            listen_port: self.cfg.endpoint_port,
            address: &address,
            peers: &peers,
        });
        self.tunnel.apply(&rendered).await?;

        // phase two: prove the primary answers over the overlay, then
        // rebind replication onto its overlay address
        let gateway: IpAddr = resp.master.gateway_ip.parse().map_err(|_| {
            ServerError::Config(format!("invalid master gateway {}", resp.master.gateway_ip))
        })?;
        self.probe
            .wait_reachable(gateway, DEFAULT_PROBE_DEADLINE, &self.cancel)
            .await?;

        self.follow_master(&resp.master).await?;
        self.wait_replication_sync().await?;
        self.spawn_replica_monitor();
        Ok(())
    }

    fn build_client(&self, addr: &str) -> Result<Client> {
        let mut builder = Client::builder().skip_verify(self.cfg.tls_skip_verify);
        if let Some(path) = &self.cfg.tls_identity {
            builder = builder.identity_pem(std::fs::read(path)?);
        }
        Ok(builder.build(addr)?)
    }

    async fn wait_replication_sync(&self) -> Result<()> {
        let wait = async {
            loop {
                match self.replication.link_up().await {
                    Ok(true) => return,
                    Ok(false) => debug!("replication link not yet up"),
                    Err(e) => warn!(error = %e, "replication status check failed"),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ServerError::Timeout("replication sync".to_string())),
            result = tokio::time::timeout(REPLICATION_SYNC_TIMEOUT, wait) => {
                result.map_err(|_| ServerError::Timeout("replication sync".to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    /// Start-without-seed path: assume the primary role when no live
    /// descriptor exists, otherwise follow the descriptor's owner
    pub async fn configure_node(self: &Arc<Self>) -> Result<()> {
        match self.registry.master().await? {
            Some(master) if master.id != self.cfg.id => {
                self.follow_master(&master).await?;
                self.spawn_replica_monitor();
                Ok(())
            }
            _ => self.become_primary().await,
        }
    }

    async fn become_primary(self: &Arc<Self>) -> Result<()> {
        info!(id = %self.cfg.id, "assuming primary role");
        self.replication.promote().await?;
        self.registry.writable().swap(self.registry.local());

        // the descriptor advertises the overlay gateway, so the subnet
        // must be assigned before the first write
        self.registry
            .ensure_node_subnet(&self.cfg.id, self.cfg.node_network)
            .await?;

        for id in &self.cfg.authorized_peers {
            self.registry.authorize_peer(id).await?;
        }

        self.write_master_info().await?;
        self.spawn_master_heartbeat();
        self.role.send_replace(Role::Primary);
        Ok(())
    }

    async fn follow_master(&self, master: &Master) -> Result<()> {
        info!(master = %master.id, store = %master.store_url, "configuring as replica");
        let (host, port) = trellis_store::parse_store_url(&master.store_url)?;
        self.replication.follow(&host, port).await?;

        let remote = self.connector.connect(&master.store_url).await?;
        self.registry.writable().swap(remote);
        self.role.send_replace(Role::Replica);
        Ok(())
    }

    async fn write_master_info(&self) -> Result<()> {
        self.registry.set_cluster_key(&self.cfg.cluster_key).await?;

        // joiners probe this address and rebind replication onto it, so
        // it must be the overlay gateway, never the underlay endpoint
        let gateway = self
            .registry
            .gateway_ip(&self.cfg.id)
            .await?
            .ok_or_else(|| ServerError::Config("node subnet not assigned".to_string()))?
            .to_string();
        let master = Master {
            id: self.cfg.id.clone(),
            addr: self.cfg.advertise_addr.clone(),
            store_url: self.cfg.advertised_store_url(&gateway),
            gateway_ip: gateway,
        };
        self.registry
            .set_master(&master, MASTER_HEARTBEAT_INTERVAL)
            .await
    }

    /// Refresh the local node record
    pub async fn update_local_node(&self) -> Result<Node> {
        let key_pair = self.registry.get_or_create_keypair(&self.cfg.id).await?;
        let gateway = self
            .registry
            .gateway_ip(&self.cfg.id)
            .await?
            .ok_or_else(|| ServerError::Config("node subnet not assigned".to_string()))?;

        let node = Node {
            id: self.cfg.id.clone(),
            name: self.cfg.name.clone(),
            addr: self.cfg.advertise_addr.clone(),
            key_pair,
            endpoint_ip: self.cfg.endpoint_ip.clone(),
            endpoint_port: self.cfg.endpoint_port,
            gateway_ip: gateway.to_string(),
            interface_name: self.cfg.interface_name.clone(),
            updated_at: now_secs(),
        };
        self.registry.put_node(&node, NODE_HEARTBEAT_EXPIRY).await?;
        Ok(node)
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    fn spawn_master_heartbeat(self: &Arc<Self>) {
        let controller = self.clone();
        tokio::spawn(async move {
            debug!(
                interval = ?MASTER_HEARTBEAT_INTERVAL,
                "starting primary heartbeat"
            );
            let mut ticker = tokio::time::interval(MASTER_HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = controller.write_master_info().await {
                            error!(error = %e, "primary heartbeat failed");
                        }
                    }
                }
            }
            debug!("primary heartbeat stopped");
        });
    }

    /// Periodically re-write the local node record
    pub fn spawn_node_heartbeat(self: &Arc<Self>) {
        let controller = self.clone();
        tokio::spawn(async move {
            debug!(interval = ?NODE_HEARTBEAT_INTERVAL, "starting node heartbeat");
            let mut ticker = tokio::time::interval(NODE_HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = controller.update_local_node().await {
                            error!(error = %e, "node heartbeat failed");
                        }
                    }
                }
            }
            debug!("node heartbeat stopped");
        });
    }

    /// Watch for a lapsed primary descriptor and promote when this node
    /// is the election candidate
    fn spawn_replica_monitor(self: &Arc<Self>) {
        let controller = self.clone();
        tokio::spawn(async move {
            debug!(interval = ?MASTER_HEARTBEAT_INTERVAL, "starting replica monitor");
            let mut ticker = tokio::time::interval(MASTER_HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match controller.monitor_tick().await {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(e) => warn!(error = %e, "replica monitor tick failed"),
                        }
                    }
                }
            }
            debug!("replica monitor stopped");
        });
    }

    /// One replica-monitor pass; returns `true` once this node promoted
    pub async fn monitor_tick(self: &Arc<Self>) -> Result<bool> {
        if self.registry.master().await?.is_some() {
            return Ok(false);
        }

        let nodes = self.registry.nodes().await?;
        let Some(candidate) = elect_candidate(&nodes) else {
            return Ok(false);
        };
        if candidate.id != self.cfg.id {
            debug!(candidate = %candidate.id, "primary absent; waiting for candidate");
            return Ok(false);
        }

        info!("primary descriptor absent; promoting");
        self.configure_node().await?;
        Ok(true)
    }

    /// Rebuild the tunnel configuration whenever a restart event arrives
    pub fn spawn_event_listener(self: &Arc<Self>, updater: Arc<Updater>) {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                let mut stream = match controller.registry.subscribe_restart_tunnel().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "event subscription failed");
                        tokio::select! {
                            _ = controller.cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                        }
                    }
                };
                loop {
                    tokio::select! {
                        _ = controller.cancel.cancelled() => return,
                        event = stream.next() => match event {
                            Some(_) => {
                                info!("tunnel restart event received");
                                if let Err(e) = updater.run_once().await {
                                    warn!(error = %e, "tunnel rebuild failed");
                                }
                            }
                            None => {
                                warn!("event stream closed; resubscribing");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Pick the presumptive new primary: the most recently updated node record
///
/// The listing is sorted by `updated_at` ascending with the ID as
/// tiebreak; the last element wins. Every surviving node computes the
/// same answer, and only the winner recreates the descriptor.
pub fn elect_candidate(nodes: &[Node]) -> Option<&Node> {
    let mut sorted: Vec<&Node> = nodes.iter().collect();
    sorted.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_proto::KeyPair;

    fn node(id: &str, updated_at: u64) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            addr: format!("{id}:9000"),
            key_pair: KeyPair {
                private_key: "priv".to_string(),
                public_key: "pub".to_string(),
            },
            endpoint_ip: "203.0.113.10".to_string(),
            endpoint_port: 51820,
            gateway_ip: "10.10.0.1".to_string(),
            interface_name: "trellis0".to_string(),
            updated_at,
        }
    }

    #[test]
    fn test_elect_candidate_picks_most_recent() {
        let nodes = vec![node("a", 100), node("b", 300), node("c", 200)];
        assert_eq!(elect_candidate(&nodes).unwrap().id, "b");
    }

    #[test]
    fn test_elect_candidate_tie_breaks_on_id() {
        let nodes = vec![node("b", 100), node("a", 100)];
        assert_eq!(elect_candidate(&nodes).unwrap().id, "b");
    }

    #[test]
    fn test_elect_candidate_empty() {
        assert!(elect_candidate(&[]).is_none());
    }
}
