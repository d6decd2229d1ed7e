//! # Repository Module
//!
//! One repository per table of the resilience schema. Each wraps a clone
//! of the pool and owns the SQL for its table.
//!
//! ```text
//!   meridian-sync service
//!        │  db.journal().append(&entry, now)
//!        ▼
//!   JournalRepository ──SQL──► journal_entries
//! ```
//!
//! Timestamps are stored as INTEGER unix milliseconds; rows are read into
//! private `*Row` structs and converted with the helpers below.
//!
//! ## Available Repositories
//!
//! - [`TerminalRepository`] - Terminal registry rows
//! - [`JournalRepository`] - Durable write journal
//! - [`SyncCheckpointRepository`] - Per-table sync markers
//! - [`ConflictRepository`] - Conflict audit log
//! - [`PowerEventRepository`] - Append-only power history
//! - [`TransactionCheckpointRepository`] - In-flight transaction state
//! - [`DeferredJobRepository`] - Hardware jobs parked in safe mode
//! - [`RecordRepository`] - Replicated table rows

pub mod conflict;
pub mod deferred_job;
pub mod journal;
pub mod power_event;
pub mod record;
pub mod sync_checkpoint;
pub mod terminal;
pub mod transaction_checkpoint;

pub use conflict::ConflictRepository;
pub use deferred_job::DeferredJobRepository;
pub use journal::{JournalRead, JournalRepository, JournalStats};
pub use power_event::PowerEventRepository;
pub use record::RecordRepository;
pub use sync_checkpoint::SyncCheckpointRepository;
pub use terminal::TerminalRepository;
pub use transaction_checkpoint::TransactionCheckpointRepository;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{DbError, DbResult};

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(entity: &str, id: impl ToString, ms: i64) -> DbResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DbError::corrupt(entity, id, format!("timestamp {} out of range", ms)))
}

pub(crate) fn opt_from_millis(
    entity: &str,
    id: impl ToString,
    ms: Option<i64>,
) -> DbResult<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(entity, id.to_string(), ms)).transpose()
}
