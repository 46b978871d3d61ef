//! Trellis Peer - client-side tunnel agent
//!
//! Periodically calls `Connect` on a cluster node, renders the peer
//! variant of the tunnel configuration from the response, and reloads the
//! local tunnel when the rendered bytes change. The first sync is fatal
//! on failure so a misconfigured agent exits instead of spinning; in-loop
//! failures are logged and retried on the next tick.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_overlay::config::{render_peer, PeerConfigSpec};
use trellis_overlay::{TunnelDriver, TunnelManager};
use trellis_proto::{Client, ClientError, Peer};

/// Default sync interval
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Errors that can occur in the peer agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// RPC against the node failed
    #[error("RPC error: {0}")]
    Rpc(#[from] ClientError),

    /// Tunnel apply failed
    #[error(transparent)]
    Overlay(#[from] trellis_overlay::OverlayError),
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Configuration of the peer agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Peer ID; must be in the cluster's authorised set
    pub id: String,
    /// Peer name, resolvable through the overlay DNS
    pub name: String,
    /// RPC address of any cluster node
    pub node_addr: String,
    /// Local tunnel interface name
    pub interface_name: String,
    /// Directory the tunnel config file is written into
    pub config_dir: PathBuf,
    /// Sync interval
    pub update_interval: Duration,
    /// Disable TLS certificate verification
    pub tls_skip_verify: bool,
}

/// The peer agent
pub struct PeerAgent {
    cfg: AgentConfig,
    client: Client,
    tunnel: TunnelManager,
}

impl PeerAgent {
    /// Build an agent with the given tunnel driver
    pub fn with_driver(cfg: AgentConfig, driver: Box<dyn TunnelDriver>) -> Result<Self> {
        let client = Client::builder()
            .skip_verify(cfg.tls_skip_verify)
            .build(&cfg.node_addr)?;
        let tunnel = TunnelManager::new(&cfg.config_dir, &cfg.interface_name, driver);
        Ok(Self {
            cfg,
            client,
            tunnel,
        })
    }

    /// One sync pass: fetch state, render, reload if changed
    pub async fn sync_once(&self) -> Result<bool> {
        debug!(node = %self.cfg.node_addr, "syncing with cluster");
        let resp = self.client.connect(&self.cfg.id, &self.cfg.name).await?;

        let peers: Vec<Peer> = resp
            .peers
            .into_iter()
            .filter(|p| p.id != self.cfg.id)
            .collect();

        let rendered = render_peer(&PeerConfigSpec {
            private_key: &resp.key_pair.private_key,
            address: &resp.address,
            dns: &resp.dns,
            peers: &peers,
        });

        let reloaded = self.tunnel.apply(&rendered).await?;
        if reloaded {
            info!(address = %resp.address, "tunnel configuration updated");
        }
        Ok(reloaded)
    }

    /// Run until cancelled; the initial sync is fatal on failure
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.sync_once().await?;

        let mut ticker = tokio::time::interval(self.cfg.update_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("peer agent stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(error = %e, "sync failed");
                    }
                }
            }
        }
    }
}
