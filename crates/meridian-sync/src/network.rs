//! # Network Monitor
//!
//! Decides whether the authoritative terminal is reachable right now.
//!
//! ## Probe Stages
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  satellite probe (each stage under probe_timeout)                       │
//! │                                                                         │
//! │  1. network            UDP "connect" towards the target: a route        │
//! │                        lookup, no packet leaves the machine             │
//! │  2. authoritative_host TCP connect to host:port, latency measured       │
//! │  3. data_path          metadata read of the shared folder               │
//! │                                                                         │
//! │  first failing stage ──► reachable = false, stage = <that stage>        │
//! │  all passed          ──► reachable = true,  stage = ok                  │
//! │                                                                         │
//! │  authoritative terminal: always reachable, latency 1 ms                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The address is re-resolved on every probe: configured address first,
//! otherwise whatever the registry lists for the authoritative terminal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;
use ts_rs::TS;

use meridian_core::TerminalRole;

use crate::error::{SyncError, SyncResult};
use crate::registry::TerminalRegistry;

// =============================================================================
// Connectivity Report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStage {
    Network,
    AuthoritativeHost,
    DataPath,
    Ok,
}

impl std::fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStage::Network => write!(f, "network"),
            ProbeStage::AuthoritativeHost => write!(f, "authoritative_host"),
            ProbeStage::DataPath => write!(f, "data_path"),
            ProbeStage::Ok => write!(f, "ok"),
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConnectivityReport {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub data_path_accessible: bool,
    pub error_message: Option<String>,
    /// The stage that failed, or `ok`.
    pub stage: ProbeStage,
    #[ts(as = "String")]
    pub checked_at: DateTime<Utc>,
}

impl ConnectivityReport {
    fn failed(stage: ProbeStage, message: String, data_path_accessible: bool) -> Self {
        ConnectivityReport {
            reachable: false,
            latency_ms: None,
            data_path_accessible,
            error_message: Some(message),
            stage,
            checked_at: Utc::now(),
        }
    }
}

// =============================================================================
// Connectivity Probe
// =============================================================================

/// Low-level checks the monitor composes into a report.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Whether a route towards `target` exists.
    async fn network_available(&self, target: &str) -> SyncResult<()>;

    /// Connects to `target` and returns the connect latency.
    async fn host_reachable(&self, target: &str) -> SyncResult<Duration>;

    async fn data_path_accessible(&self, path: &Path) -> SyncResult<()>;
}

/// Probe backed by real sockets and the filesystem.
pub struct TcpConnectivityProbe;

#[async_trait]
impl ConnectivityProbe for TcpConnectivityProbe {
    async fn network_available(&self, target: &str) -> SyncResult<()> {
        let bind = if target.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| SyncError::NetworkUnavailable(format!("no local socket: {}", e)))?;
        socket
            .connect(target)
            .await
            .map_err(|e| SyncError::NetworkUnavailable(format!("no route to {}: {}", target, e)))
    }

    async fn host_reachable(&self, target: &str) -> SyncResult<Duration> {
        let started = Instant::now();
        TcpStream::connect(target)
            .await
            .map_err(|e| SyncError::NetworkUnavailable(format!("{} refused: {}", target, e)))?;
        Ok(started.elapsed())
    }

    async fn data_path_accessible(&self, path: &Path) -> SyncResult<()> {
        tokio::fs::metadata(path).await.map(|_| ()).map_err(|e| {
            SyncError::NetworkUnavailable(format!("{} not accessible: {}", path.display(), e))
        })
    }
}

// =============================================================================
// Network Monitor
// =============================================================================

pub struct NetworkMonitor {
    role: TerminalRole,
    configured_address: Option<String>,
    data_path: Option<PathBuf>,
    probe_timeout: Duration,
    probe: Arc<dyn ConnectivityProbe>,
    registry: Option<TerminalRegistry>,
    consecutive_failures: AtomicU32,
}

impl NetworkMonitor {
    pub fn new(
        role: TerminalRole,
        configured_address: Option<String>,
        data_path: Option<PathBuf>,
        probe_timeout: Duration,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        NetworkMonitor {
            role,
            configured_address,
            data_path,
            probe_timeout,
            probe,
            registry: None,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Registry consulted when no address is configured.
    pub fn with_registry(mut self, registry: TerminalRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Runs the probe stages. Never fails: problems are in the report.
    pub async fn probe(&self) -> ConnectivityReport {
        let report = self.run_stages().await;

        if report.reachable {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                stage = %report.stage,
                failures,
                error = ?report.error_message,
                "Connectivity probe failed"
            );
        }

        report
    }

    async fn run_stages(&self) -> ConnectivityReport {
        if self.role.is_authoritative() {
            return ConnectivityReport {
                reachable: true,
                latency_ms: Some(1),
                data_path_accessible: true,
                error_message: None,
                stage: ProbeStage::Ok,
                checked_at: Utc::now(),
            };
        }

        let address = self.resolve_address().await;
        let mut latency_ms = None;

        match address {
            Some(ref address) => {
                if let Err(message) = self
                    .stage(self.probe.network_available(address))
                    .await
                {
                    return ConnectivityReport::failed(ProbeStage::Network, message, false);
                }

                match self.stage(self.probe.host_reachable(address)).await {
                    Ok(latency) => latency_ms = Some(latency.as_millis().max(1) as u64),
                    Err(message) => {
                        return ConnectivityReport::failed(
                            ProbeStage::AuthoritativeHost,
                            message,
                            false,
                        )
                    }
                }
            }
            // File-share deployments: the data path alone decides
            None if self.data_path.is_some() => {}
            None => {
                return ConnectivityReport::failed(
                    ProbeStage::AuthoritativeHost,
                    "no authoritative address configured or registered".into(),
                    false,
                )
            }
        }

        if let Some(ref path) = self.data_path {
            if let Err(message) = self.stage(self.probe.data_path_accessible(path)).await {
                let mut report = ConnectivityReport::failed(ProbeStage::DataPath, message, false);
                report.latency_ms = latency_ms;
                return report;
            }
        }

        ConnectivityReport {
            reachable: true,
            latency_ms,
            data_path_accessible: true,
            error_message: None,
            stage: ProbeStage::Ok,
            checked_at: Utc::now(),
        }
    }

    async fn stage<T>(
        &self,
        check: impl std::future::Future<Output = SyncResult<T>>,
    ) -> Result<T, String> {
        match timeout(self.probe_timeout, check).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {} ms",
                self.probe_timeout.as_millis()
            )),
        }
    }

    async fn resolve_address(&self) -> Option<String> {
        if let Some(ref address) = self.configured_address {
            return Some(address.clone());
        }

        let registry = self.registry.as_ref()?;
        match registry.authoritative().await {
            Ok(terminal) => terminal.and_then(|t| t.address),
            Err(e) => {
                debug!(error = %e, "Registry lookup for authoritative address failed");
                None
            }
        }
    }
}
