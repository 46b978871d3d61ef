//! trellis-peer -- client-side tunnel agent
//!
//! Syncs this machine's tunnel with a Trellis cluster: connects through
//! any node, writes the peer tunnel configuration, and reloads on change.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use trellis_overlay::WgQuickDriver;
use trellis_peer::{AgentConfig, PeerAgent, DEFAULT_UPDATE_INTERVAL};

/// Trellis client peer agent
#[derive(Parser)]
#[command(name = "trellis-peer", version, about)]
struct Cli {
    /// Peer ID; must be in the cluster's authorised set
    #[arg(long, env = "TRELLIS_PEER_ID")]
    id: Option<String>,

    /// Peer name resolvable through the overlay DNS (defaults to the ID)
    #[arg(long)]
    name: Option<String>,

    /// RPC address of any cluster node
    #[arg(long)]
    node: String,

    /// Local tunnel interface name
    #[arg(long, default_value = "trellis0")]
    interface: String,

    /// Directory the tunnel config file is written into
    #[arg(long, default_value = "/etc/wireguard")]
    config_dir: PathBuf,

    /// Sync interval in seconds
    #[arg(long, default_value_t = DEFAULT_UPDATE_INTERVAL.as_secs())]
    interval: u64,

    /// Disable TLS certificate verification
    #[arg(long)]
    skip_verify: bool,

    /// Enable debug logging
    #[arg(short = 'D', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let id = cli.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let cfg = AgentConfig {
        name: cli.name.unwrap_or_else(|| id.clone()),
        id,
        node_addr: cli.node,
        interface_name: cli.interface,
        config_dir: cli.config_dir,
        update_interval: Duration::from_secs(cli.interval.max(1)),
        tls_skip_verify: cli.skip_verify,
    };
    info!(id = %cfg.id, node = %cfg.node_addr, "starting peer agent");

    let agent = match PeerAgent::with_driver(cfg, Box::new(WgQuickDriver)) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!(error = %e, "agent setup failed");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    match agent.run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "peer agent failed");
            ExitCode::FAILURE
        }
    }
}
