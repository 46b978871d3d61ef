//! Managed `redis-server` child process
//!
//! Each node owns its store instance. A deterministic configuration file is
//! rendered into the data directory on every launch (with or without a
//! `replicaof` line) and the process is supervised for the lifetime of the
//! node. The controller later re-points replication at runtime with
//! `REPLICAOF`; the rendered file only decides the initial role.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// How long to wait for the launched store to accept connections
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for the managed store process
#[derive(Debug, Clone)]
pub struct StoreProcessConfig {
    /// Directory for the config file and snapshots
    pub data_dir: PathBuf,
    /// Listen address
    pub bind: IpAddr,
    /// Listen port
    pub port: u16,
    /// Initial primary to replicate from, if starting as a replica
    pub replica_of: Option<(String, u16)>,
}

impl StoreProcessConfig {
    /// Render the deterministic configuration file contents
    pub fn render(&self) -> String {
        let mut conf = format!(
            "# managed by trellisd\n\
             dir {}\n\
             bind {}\n\
             port {}\n\
             protected-mode no\n\
             timeout 0\n\
             tcp-keepalive 300\n\
             daemonize no\n\
             supervised no\n\
             databases 1\n\
             save 900 1\n\
             save 300 10\n\
             save 60 1000\n\
             dbfilename dump.rdb\n\
             replica-serve-stale-data yes\n\
             replica-read-only yes\n\
             appendonly no\n",
            self.data_dir.display(),
            self.bind,
            self.port,
        );
        if let Some((host, port)) = &self.replica_of {
            conf.push_str(&format!("replicaof {host} {port}\n"));
        }
        conf
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join("store.conf")
    }

    /// Local URL of the launched store
    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }
}

/// A running store process
pub struct StoreProcess {
    child: Child,
    config: StoreProcessConfig,
}

impl StoreProcess {
    /// Write the config file and launch `redis-server`
    ///
    /// Blocks until the store accepts TCP connections or the launch
    /// timeout lapses.
    pub async fn launch(config: StoreProcessConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let conf_path = config.config_path();
        if tokio::fs::try_exists(&conf_path).await? {
            tokio::fs::remove_file(&conf_path).await?;
        }
        tokio::fs::write(&conf_path, config.render()).await?;

        info!(
            port = config.port,
            data_dir = %config.data_dir.display(),
            replica = config.replica_of.is_some(),
            "launching store process"
        );

        let child = Command::new("redis-server")
            .arg(&conf_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StoreError::Process(format!("failed to spawn redis-server: {e}")))?;

        let process = Self { child, config };
        process.wait_ready().await?;
        Ok(process)
    }

    async fn wait_ready(&self) -> Result<()> {
        let addr = ("127.0.0.1", self.config.port);
        let wait = async {
            loop {
                if TcpStream::connect(addr).await.is_ok() {
                    debug!(port = self.config.port, "store process ready");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(LAUNCH_TIMEOUT, wait)
            .await
            .map_err(|_| StoreError::Timeout("store process to accept connections".to_string()))
    }

    /// Local URL of this store
    pub fn url(&self) -> String {
        self.config.url()
    }

    /// Stop the process
    pub async fn shutdown(&mut self) -> Result<()> {
        info!(port = self.config.port, "stopping store process");
        self.child
            .kill()
            .await
            .map_err(|e| StoreError::Process(format!("failed to stop store process: {e}")))?;
        Ok(())
    }
}

/// Render a config for a data directory without building the full process
/// config first
pub fn default_config(data_dir: &Path, port: u16) -> StoreProcessConfig {
    StoreProcessConfig {
        data_dir: data_dir.join("store"),
        bind: IpAddr::from([0, 0, 0, 0]),
        port,
        replica_of: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_primary_config() {
        let config = StoreProcessConfig {
            data_dir: PathBuf::from("/var/lib/trellis/store"),
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 6379,
            replica_of: None,
        };
        let conf = config.render();
        assert!(conf.contains("dir /var/lib/trellis/store"));
        assert!(conf.contains("bind 0.0.0.0"));
        assert!(conf.contains("port 6379"));
        assert!(!conf.contains("replicaof"));
    }

    #[test]
    fn test_render_replica_config() {
        let config = StoreProcessConfig {
            data_dir: PathBuf::from("/var/lib/trellis/store"),
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 6380,
            replica_of: Some(("10.10.0.1".to_string(), 6379)),
        };
        assert!(config.render().contains("replicaof 10.10.0.1 6379"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let config = default_config(Path::new("/tmp/t"), 6379);
        assert_eq!(config.render(), config.render());
        assert_eq!(config.url(), "redis://127.0.0.1:6379");
    }
}
