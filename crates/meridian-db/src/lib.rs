//! # meridian-db: Database Layer for the Resilience Subsystem
//!
//! SQLite storage for everything a terminal must not lose across a power
//! cut: its journal, its sync markers, its conflict log, its power history,
//! its in-flight transactions and the hardware work parked in safe mode.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  meridian-sync services                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   meridian-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │◄───│ terminal, journal, │  │ (embedded) │  │   │
//! │  │   │ WAL + FULL    │    │ conflict, power... │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  terminal.db (local)    shared/authoritative.db (satellites, remote)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("terminal.db")).await?;
//! let pending = db.journal().count_pending().await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::journal::Appended;
pub use repository::{
    ConflictRepository, DeferredJobRepository, JournalRead, JournalRepository, JournalStats,
    PowerEventRepository, RecordRepository, SyncCheckpointRepository, TerminalRepository,
    TransactionCheckpointRepository,
};
