//! Overlay reachability probing
//!
//! A joining node must prove the primary's gateway answers over the fresh
//! tunnel before rebinding its store replication onto the overlay. The
//! probe shells out to `ping` once per second under an overall deadline
//! and honors cancellation.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OverlayError, Result};

/// Default overall probe deadline
pub const DEFAULT_PROBE_DEADLINE: Duration = Duration::from_secs(30);

/// Timeout for a single ping attempt
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Proves a host answers over the overlay
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn wait_reachable(
        &self,
        ip: IpAddr,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// ICMP echo probe
pub struct PingProbe;

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn wait_reachable(
        &self,
        ip: IpAddr,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        wait_for_reachable(ip, deadline, cancel).await
    }
}

/// Probe that reports every host reachable
///
/// For tests and development hosts with no tunnel toolchain.
pub struct AlwaysReachable;

#[async_trait]
impl ReachabilityProbe for AlwaysReachable {
    async fn wait_reachable(
        &self,
        _ip: IpAddr,
        _deadline: Duration,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

/// Wait until the host answers an ICMP echo
pub async fn wait_for_reachable(
    ip: IpAddr,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let attempts = async {
        loop {
            if ping_once(ip).await {
                debug!(%ip, "reachability probe succeeded");
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(OverlayError::Cancelled),
        result = tokio::time::timeout(deadline, attempts) => result.map_err(|_| {
            OverlayError::Unreachable(ip.to_string(), format!("no reply within {deadline:?}"))
        }),
    }
}

async fn ping_once(ip: IpAddr) -> bool {
    let output = tokio::time::timeout(
        ATTEMPT_TIMEOUT,
        Command::new("ping")
            .args(["-c", "1", "-W", "1", &ip.to_string()])
            .output(),
    )
    .await;

    matches!(output, Ok(Ok(result)) if result.status.success())
}
