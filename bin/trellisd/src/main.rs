//! trellisd -- Trellis control-plane node daemon
//!
//! Runs the embedded replicated store, the cluster controller, the RPC
//! surface, and the overlay DNS resolver on one node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use trellis_server::{Config, Server};

/// Trellis overlay-network control-plane node
#[derive(Parser)]
#[command(name = "trellisd", version, about)]
struct Cli {
    /// Node ID; generated and persisted behavior is up to the operator,
    /// a random ID is used when omitted
    #[arg(long, env = "TRELLIS_ID")]
    id: Option<String>,

    /// Node name resolvable through the overlay DNS (defaults to the ID)
    #[arg(long)]
    name: Option<String>,

    /// Data directory for the embedded store
    #[arg(long, default_value = "/var/lib/trellis")]
    data_dir: PathBuf,

    /// Listen port of the embedded store
    #[arg(long, default_value_t = 6379)]
    store_port: u16,

    /// RPC bind address
    #[arg(long, default_value = "0.0.0.0:9000")]
    addr: SocketAddr,

    /// RPC address advertised to the cluster (defaults to
    /// <endpoint-ip>:<rpc-port>)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Seed node to join through
    #[arg(long)]
    seed: Option<String>,

    /// Pre-shared cluster key
    #[arg(long, env = "TRELLIS_CLUSTER_KEY")]
    cluster_key: String,

    /// Network carved into per-node subnets
    #[arg(long, default_value = "10.10.0.0/16")]
    node_network: Ipv4Net,

    /// Network peer IPs are allocated from
    #[arg(long, default_value = "10.51.0.0/16")]
    peer_network: Ipv4Net,

    /// Underlay IP the tunnel endpoint is reachable at
    #[arg(long)]
    endpoint_ip: String,

    /// Underlay port the tunnel listens on
    #[arg(long, default_value_t = 51820)]
    endpoint_port: u16,

    /// DNS resolver listen address
    #[arg(long, default_value = "0.0.0.0:53")]
    dns_addr: SocketAddr,

    /// Upstream resolver for names outside the overlay
    #[arg(long, default_value = "1.1.1.1:53")]
    dns_upstream: SocketAddr,

    /// Tunnel interface name
    #[arg(long, default_value = "trellis0")]
    interface: String,

    /// Underlay ethernet interface masqueraded out of
    #[arg(long, default_value = "eth0")]
    underlay_interface: String,

    /// Directory the tunnel config file is written into
    #[arg(long, default_value = "/etc/wireguard")]
    config_dir: PathBuf,

    /// Peer ID authorised on first primary start (repeatable)
    #[arg(long = "authorized-peer")]
    authorized_peers: Vec<String>,

    /// PEM client identity presented on outbound RPC
    #[arg(long)]
    tls_identity: Option<PathBuf>,

    /// Disable TLS certificate verification on outbound RPC
    #[arg(long)]
    skip_verify: bool,

    /// Enable debug logging
    #[arg(short = 'D', long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let advertise_addr = self
            .advertise_addr
            .unwrap_or_else(|| format!("{}:{}", self.endpoint_ip, self.addr.port()));
        Config {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            data_dir: self.data_dir,
            store_port: self.store_port,
            bind_addr: self.addr,
            advertise_addr,
            seed_addr: self.seed,
            cluster_key: self.cluster_key,
            node_network: self.node_network,
            peer_network: self.peer_network,
            endpoint_ip: self.endpoint_ip,
            endpoint_port: self.endpoint_port,
            dns_listen: self.dns_addr,
            dns_upstream: self.dns_upstream,
            interface_name: self.interface,
            underlay_interface: self.underlay_interface,
            config_dir: self.config_dir,
            authorized_peers: self.authorized_peers,
            tls_identity: self.tls_identity,
            tls_skip_verify: self.skip_verify,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cfg = cli.into_config();
    info!(id = %cfg.id, name = %cfg.name, "starting trellisd");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match Server::new(cfg).run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "node failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}
