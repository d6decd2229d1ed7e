//! # meridian-core: Pure Resilience Logic for Meridian POS
//!
//! Domain types and decision rules for the multi-terminal resilience
//! subsystem. Nothing in this crate touches a database, a socket, a clock
//! or a UPS; callers pass `now` in explicitly.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Meridian Resilience Layers                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            meridian-sync (background services)                  │   │
//! │  │   SyncCoordinator, PowerMonitor, SafeModeController, ...        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              meridian-db (SQLite repositories)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ meridian-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐  │   │
//! │  │   │ terminal │ │ journal  │ │ conflict │ │ power            │  │   │
//! │  │   │ registry │ │ envelope │ │ LWW      │ │ classify/events  │  │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`terminal`] - Terminal identity, role and health
//! - [`journal`] - Journal entries and the typed payload envelope
//! - [`record`] - Replicated records and sync markers
//! - [`conflict`] - Last-write-wins resolver and conflict audit records
//! - [`power`] - Power classification and transition events
//! - [`checkpoint`] - In-flight transaction checkpoints
//! - [`hardware`] - Hardware jobs deferred during safe mode
//! - [`validation`] - Input validation
//! - [`error`] - Domain error types

pub mod checkpoint;
pub mod conflict;
pub mod error;
pub mod hardware;
pub mod journal;
pub mod power;
pub mod record;
pub mod terminal;
pub mod validation;

use chrono::{DateTime, SubsecRound, Utc};

pub use checkpoint::{CheckpointState, TransactionCheckpoint, TransactionSnapshot};
pub use conflict::{
    ConflictRecord, ConflictResolver, ConflictState, ConflictStrategy, NewConflict, RecordVersion,
    Resolution, Winner,
};
pub use error::{CoreError, CoreResult, ValidationError};
pub use hardware::{DeferredJob, DeferredJobStatus, HardwareJob, HardwareJobKind};
pub use journal::{
    JournalEntry, JournalEnvelope, JournalOperation, JournalPayload, JournalStatus,
    NewJournalEntry, RecordSnapshot, SaleLine, SaleSnapshot,
};
pub use power::{
    NewPowerEvent, PowerEvent, PowerEventType, PowerHealth, PowerReading, PowerSnapshot,
    PowerState, PowerThresholds, RecoveryStatus,
};
pub use record::{tables, StoreRecord, SyncCheckpoint, SyncMarker};
pub use terminal::{
    Terminal, TerminalRegistration, TerminalRole, TerminalStatus, TerminalSummary, SyncStatus,
};

/// Truncates a timestamp to the millisecond precision used in storage, so
/// values compare equal before and after a round-trip through the database.
pub fn storage_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}
