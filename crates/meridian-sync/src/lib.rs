//! # meridian-sync: Resilience Services for Meridian POS
//!
//! Keeps a terminal selling while the store network or mains power is
//! down, and reconciles it with the authoritative terminal once the link
//! comes back.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ResilienceService (supervisor)                      │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │TerminalRegistry│  │ NetworkMonitor │  │   SyncCoordinator      │    │
//! │  │                │  │                │  │                        │    │
//! │  │ register,      │◄─│ network ► host │◄─│ probe ► drain journal  │    │
//! │  │ heartbeat,     │  │ ► data path    │  │ ► pull ► resolve LWW   │    │
//! │  │ stale sweep    │  │                │  │ ► checkpoint markers   │    │
//! │  └────────────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │                                                      │                 │
//! │                                         ┌────────────▼───────────┐     │
//! │                                         │  TransactionJournal    │     │
//! │                                         │  append-only, ordered  │     │
//! │                                         └────────────────────────┘     │
//! │                                                                         │
//! │  ┌────────────────┐  watch  ┌────────────────────┐  gate              │
//! │  │  PowerMonitor  │────────►│ SafeModeController │──────► sale path   │
//! │  │  upsc/apcaccess│         │ defers hardware I/O│                    │
//! │  └────────────────┘         └────────────────────┘                    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ TransactionCheckpoints: auto-save, recovery after restart       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`service`] - `ResilienceService` supervisor and its loops
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Sync error types
//! - [`registry`] - Terminal registration and heartbeats
//! - [`network`] - Staged connectivity probe
//! - [`journal`] - Offline transaction journal
//! - [`coordinator`] - Sync cycle: drain, pull, conflict resolution
//! - [`store`] - Record stores the coordinator syncs against
//! - [`power`] - UPS sources and the power monitor
//! - [`safe_mode`] - Safe mode and deferred hardware jobs
//! - [`checkpoint`] - Transaction checkpoints and recovery
//! - [`notify`] - Operator notification hook
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_db::{Database, DbConfig};
//! use meridian_sync::{ResilienceConfig, ResilienceServiceBuilder};
//!
//! let config = ResilienceConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//!
//! let handle = ResilienceServiceBuilder::new(config)
//!     .with_database(db)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! handle.gate().admit_new_transaction()?;
//! let status = handle.status().await;
//! println!("Safe mode: {}", status.safe_mode);
//!
//! handle.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod journal;
pub mod network;
pub mod notify;
pub mod power;
pub mod registry;
pub mod safe_mode;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use checkpoint::TransactionCheckpoints;
pub use config::{PowerSourceKind, ResilienceConfig};
pub use coordinator::{
    CoordinatorSettings, CycleOutcome, CycleStage, CycleState, SyncCoordinator, SyncCycleResult,
};
pub use error::{SyncError, SyncResult};
pub use journal::TransactionJournal;
pub use network::{
    ConnectivityProbe, ConnectivityReport, NetworkMonitor, ProbeStage, TcpConnectivityProbe,
};
pub use notify::{NoOpNotifier, Notification, Notifier, TracingNotifier};
pub use power::{PowerMonitor, PowerPoll, PowerSource, SimulatedSource};
pub use registry::TerminalRegistry;
pub use safe_mode::{
    AdmissionGate, FlushReport, HardwareSink, SafeModeController, SafeModeState, SubmitOutcome,
    TracingSink,
};
pub use service::{ResilienceHandle, ResilienceService, ResilienceServiceBuilder, ResilienceStatus};
pub use store::{RecordStore, SharedPathStore, SqliteRecordStore};
