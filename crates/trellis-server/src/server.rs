//! Node process assembly
//!
//! Wires the embedded store, controller, loops, RPC listener, and DNS
//! resolver together and tears them down in order on shutdown.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use trellis_overlay::{PingProbe, TunnelManager, WgQuickDriver};
use trellis_store::{
    KvStore, RedisConnector, RedisStore, StoreHandle, StoreProcess, StoreProcessConfig,
};

use crate::cluster::Controller;
use crate::config::Config;
use crate::dns::DnsServer;
use crate::error::Result;
use crate::registry::Registry;
use crate::rpc::{router, AppState};
use crate::updater::Updater;

/// A running Trellis node
pub struct Server {
    cfg: Arc<Config>,
}

impl Server {
    pub fn new(cfg: Config) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    /// Run the node until the cancellation token fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let cfg = self.cfg;

        // the embedded store owns all replicated state; everything else
        // is reconstructed from it
        let mut store_process = StoreProcess::launch(StoreProcessConfig {
            data_dir: cfg.data_dir.join("store"),
            bind: IpAddr::from([0, 0, 0, 0]),
            port: cfg.store_port,
            replica_of: None,
        })
        .await?;

        let local = Arc::new(RedisStore::connect(&store_process.url()).await?);
        let local_kv: Arc<dyn KvStore> = local.clone();
        let writable = StoreHandle::new(local_kv.clone());
        let registry = Arc::new(Registry::new(local_kv, writable));

        let tunnel = Arc::new(TunnelManager::new(
            &cfg.config_dir,
            &cfg.interface_name,
            Box::new(WgQuickDriver),
        ));

        let controller = Controller::new(
            cfg.clone(),
            registry.clone(),
            local.clone(),
            Arc::new(RedisConnector),
            tunnel.clone(),
            Arc::new(PingProbe),
            cancel.child_token(),
        );

        // the first node establishes its identity before entering the
        // cluster: its very first primary descriptor must already carry
        // the overlay gateway. A joiner's subnet and keypair are
        // assigned by the primary during Join and arrive with the
        // replication sync, so they cannot be created locally here.
        if cfg.seed_addr.is_none() {
            registry.get_or_create_keypair(&cfg.id).await?;
            registry
                .ensure_node_subnet(&cfg.id, cfg.node_network)
                .await?;
        }

        // enter the cluster; fatal when the seed is unreachable or the
        // cluster key is rejected
        controller.start().await?;

        // local identity: keypair, subnet, node record, peer record
        registry.get_or_create_keypair(&cfg.id).await?;
        registry
            .ensure_node_subnet(&cfg.id, cfg.node_network)
            .await?;
        controller.update_local_node().await?;

        let updater = Updater::new(cfg.clone(), registry.clone(), tunnel);
        updater.run_once().await?;

        controller.spawn_node_heartbeat();
        controller.spawn_event_listener(updater.clone());
        updater.spawn(cancel.child_token());

        let dns = DnsServer::new(registry.clone(), cfg.dns_listen, cfg.dns_upstream);
        let dns_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = dns.run(dns_cancel).await {
                error!(error = %e, "DNS server failed");
            }
        });

        let state = AppState {
            cfg: cfg.clone(),
            registry,
        };
        let listener = TcpListener::bind(cfg.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "RPC server listening");

        let shutdown = cancel.child_token();
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("shutting down");
        controller.stop();
        store_process.shutdown().await?;
        Ok(())
    }
}
