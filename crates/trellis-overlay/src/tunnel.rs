//! Hash-gated tunnel configuration apply
//!
//! The rendered configuration is written to a temporary file next to the
//! canonical path and renamed over it, then the external driver restarts
//! the tunnel. A SHA-256 of the rendered bytes gates the whole sequence:
//! an unchanged configuration never touches the filesystem or the tunnel.
//! The last applied hash lives in process memory, so a restarted daemon
//! reloads once regardless of what is on disk.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{OverlayError, Result};

/// External process applying a configuration file to the kernel tunnel
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Cycle the named tunnel down and up so it re-reads its config file
    async fn restart(&self, interface: &str) -> Result<()>;
}

/// Driver shelling out to `wg-quick`
pub struct WgQuickDriver;

#[async_trait]
impl TunnelDriver for WgQuickDriver {
    async fn restart(&self, interface: &str) -> Result<()> {
        info!(interface, "restarting tunnel");
        // down fails when the tunnel was never up; only surface the up error
        let down = wg_quick(&["down", interface]).await;
        if let Err(e) = down {
            debug!(interface, error = %e, "tunnel down skipped");
        }
        wg_quick(&["up", interface]).await?;
        Ok(())
    }
}

async fn wg_quick(args: &[&str]) -> Result<()> {
    let output = Command::new("wg-quick")
        .args(args)
        .output()
        .await
        .map_err(|e| OverlayError::Driver(format!("wg-quick {}: {e}", args.join(" "))))?;
    if !output.status.success() {
        return Err(OverlayError::Driver(format!(
            "wg-quick {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Driver that does nothing
///
/// For development hosts without the tunnel toolchain installed.
pub struct NullDriver;

#[async_trait]
impl TunnelDriver for NullDriver {
    async fn restart(&self, interface: &str) -> Result<()> {
        debug!(interface, "null tunnel driver: restart skipped");
        Ok(())
    }
}

/// Applies rendered configurations to one tunnel interface
pub struct TunnelManager {
    config_path: PathBuf,
    interface: String,
    driver: Box<dyn TunnelDriver>,
    last_hash: Mutex<String>,
}

impl TunnelManager {
    /// Manage the config file at `<config_dir>/<interface>.conf`
    pub fn new(config_dir: &Path, interface: &str, driver: Box<dyn TunnelDriver>) -> Self {
        Self {
            config_path: config_dir.join(format!("{interface}.conf")),
            interface: interface.to_string(),
            driver,
            last_hash: Mutex::new(String::new()),
        }
    }

    /// Canonical config file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Apply a rendered configuration
    ///
    /// Returns `true` when the tunnel was reloaded, `false` when the
    /// configuration was unchanged. A driver failure is returned after the
    /// new file and hash are in place, so the retry happens on the next
    /// content change rather than hammering a broken driver every tick.
    pub async fn apply(&self, rendered: &str) -> Result<bool> {
        let hash = hash_bytes(rendered.as_bytes());
        {
            let last = self.last_hash.lock().unwrap();
            if *last == hash {
                return Ok(false);
            }
        }

        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.config_path.with_extension("conf.next");
        tokio::fs::write(&tmp_path, rendered).await?;
        tokio::fs::rename(&tmp_path, &self.config_path).await?;

        info!(
            interface = %self.interface,
            version = %&hash[..12],
            "tunnel configuration updated"
        );
        *self.last_hash.lock().unwrap() = hash;

        if let Err(e) = self.driver.restart(&self.interface).await {
            warn!(interface = %self.interface, error = %e, "tunnel reload failed");
            return Err(e);
        }
        Ok(true)
    }
}

/// Hex SHA-256 of the given bytes
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingDriver {
        restarts: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl TunnelDriver for CountingDriver {
        async fn restart(&self, _interface: &str) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OverlayError::Driver("boom".to_string()));
            }
            Ok(())
        }
    }

    fn manager(dir: &Path, restarts: Arc<AtomicUsize>, fail: bool) -> TunnelManager {
        TunnelManager::new(dir, "trellis0", Box::new(CountingDriver { restarts, fail }))
    }

    #[tokio::test]
    async fn test_apply_reloads_once_for_stable_config() {
        let dir = tempfile::tempdir().unwrap();
        let restarts = Arc::new(AtomicUsize::new(0));
        let manager = manager(dir.path(), restarts.clone(), false);

        assert!(manager.apply("config-v1").await.unwrap());
        assert!(!manager.apply("config-v1").await.unwrap());
        assert!(!manager.apply("config-v1").await.unwrap());
        assert_eq!(restarts.load(Ordering::SeqCst), 1);

        let on_disk = std::fs::read_to_string(manager.config_path()).unwrap();
        assert_eq!(on_disk, "config-v1");
    }

    #[tokio::test]
    async fn test_apply_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let restarts = Arc::new(AtomicUsize::new(0));
        let manager = manager(dir.path(), restarts.clone(), false);

        manager.apply("config-v1").await.unwrap();
        assert!(manager.apply("config-v2").await.unwrap());
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
        assert_eq!(
            std::fs::read_to_string(manager.config_path()).unwrap(),
            "config-v2"
        );
    }

    #[tokio::test]
    async fn test_driver_failure_keeps_file_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let restarts = Arc::new(AtomicUsize::new(0));
        let manager = manager(dir.path(), restarts.clone(), true);

        assert!(manager.apply("config-v1").await.is_err());
        // the file is in place and the same content is not re-applied
        assert_eq!(
            std::fs::read_to_string(manager.config_path()).unwrap(),
            "config-v1"
        );
        assert!(!manager.apply("config-v1").await.unwrap());
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let restarts = Arc::new(AtomicUsize::new(0));
        let manager = manager(dir.path(), restarts, false);
        manager.apply("config-v1").await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["trellis0.conf"]);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_bytes(b"x"), hash_bytes(b"x"));
        assert_ne!(hash_bytes(b"x"), hash_bytes(b"y"));
    }
}
