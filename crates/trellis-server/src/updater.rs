//! Peer-updater loop
//!
//! Every tick: refresh this node's own peer record (keypair, endpoint,
//! gateway subnet plus owned routes as allowed IPs), skipping the write
//! when the marshalled bytes are unchanged, then read all peers and
//! re-render the tunnel configuration. The render is hash-gated, so a
//! stable cluster reloads the tunnel at most once.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trellis_overlay::config::{render_node, NodeConfigSpec};
use trellis_overlay::tunnel::hash_bytes;
use trellis_overlay::{subnets, TunnelManager};
use trellis_proto::Peer;

use crate::config::{Config, PEER_UPDATE_INTERVAL};
use crate::error::Result;
use crate::registry::Registry;

/// Keeps the local peer record and tunnel configuration in sync
pub struct Updater {
    cfg: Arc<Config>,
    registry: Arc<Registry>,
    tunnel: Arc<TunnelManager>,
    last_record_hash: Mutex<String>,
}

impl Updater {
    pub fn new(cfg: Arc<Config>, registry: Arc<Registry>, tunnel: Arc<TunnelManager>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry,
            tunnel,
            last_record_hash: Mutex::new(String::new()),
        })
    }

    /// One updater pass
    pub async fn run_once(&self) -> Result<()> {
        self.update_own_peer_record().await?;
        self.refresh_tunnel_config().await
    }

    /// Rebuild and publish this node's peer record
    async fn update_own_peer_record(&self) -> Result<()> {
        let key_pair = self.registry.get_or_create_keypair(&self.cfg.id).await?;

        let mut allowed_ips = Vec::new();
        if let Some(subnet) = self.registry.node_subnet(&self.cfg.id).await? {
            allowed_ips.push(subnet.to_string());
        }
        for route in self.registry.routes().await? {
            if route.node_id == self.cfg.id {
                allowed_ips.push(route.network);
            }
        }

        let peer = Peer {
            id: self.cfg.id.clone(),
            name: self.cfg.name.clone(),
            key_pair,
            allowed_ips,
            endpoint: self.cfg.endpoint(),
            peer_ip: String::new(),
        };

        let bytes = serde_json::to_vec(&peer)?;
        let hash = hash_bytes(&bytes);
        {
            let last = self.last_record_hash.lock().unwrap();
            if *last == hash {
                return Ok(());
            }
        }

        debug!(endpoint = %peer.endpoint, allowed = ?peer.allowed_ips, "publishing peer record");
        self.registry.put_peer(&peer).await?;
        *self.last_record_hash.lock().unwrap() = hash;
        Ok(())
    }

    /// Re-render the tunnel configuration from current cluster state
    async fn refresh_tunnel_config(&self) -> Result<()> {
        let Some(subnet) = self.registry.node_subnet(&self.cfg.id).await? else {
            // not yet assigned; nothing to render against
            debug!("skipping tunnel refresh: no subnet assigned");
            return Ok(());
        };
        let key_pair = self.registry.get_or_create_keypair(&self.cfg.id).await?;
        let address = subnets::gateway_address(subnet)?;

        let peers: Vec<Peer> = self
            .registry
            .peers()
            .await?
            .into_iter()
            .filter(|p| p.id != self.cfg.id)
            .collect();

        let rendered = render_node(&NodeConfigSpec {
            interface: &self.cfg.interface_name,
            underlay_interface: &self.cfg.underlay_interface,
            private_key: &key_pair.private_key,
            listen_port: self.cfg.endpoint_port,
            address: &address,
            peers: &peers,
        });

        self.tunnel.apply(&rendered).await?;
        Ok(())
    }

    /// Run the updater until cancelled
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let updater = self.clone();
        tokio::spawn(async move {
            debug!(interval = ?PEER_UPDATE_INTERVAL, "starting peer updater");
            let mut ticker = tokio::time::interval(PEER_UPDATE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = updater.run_once().await {
                            warn!(error = %e, "peer update failed");
                        }
                    }
                }
            }
            debug!("peer updater stopped");
        });
    }
}
