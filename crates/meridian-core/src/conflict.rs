//! # Conflict Resolution
//!
//! Decides which of two divergent versions of the same record survives.
//!
//! ## Last-Write-Wins
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         resolve(local, remote, now)                     │
//! │                                                                         │
//! │  timestamp missing on either side ─────────────► DEFERRED               │
//! │  timestamp > now + max_clock_skew on either ───► DEFERRED               │
//! │                                                                         │
//! │  local.modified_at  > remote.modified_at ──────► LOCAL wins             │
//! │  remote.modified_at > local.modified_at ───────► REMOTE wins            │
//! │                                                                         │
//! │  equal timestamps:                                                     │
//! │    smaller terminal id wins ───────────────────► LOCAL | REMOTE         │
//! │    same terminal id ───────────────────────────► REMOTE wins            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The policy is lossy: the losing version is kept only in the
//! [`ConflictRecord`] audit trail. There is no per-field merge.
//!
//! The tie-break never looks at arrival order, so resolving the same pair
//! on any terminal at any time gives the same answer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::record::StoreRecord;

/// Default tolerance for clocks running ahead of this terminal.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 300;

// =============================================================================
// Enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::LastWriteWins => write!(f, "last_write_wins"),
        }
    }
}

/// Which side of a conflict survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Winner::Local => write!(f, "local"),
            Winner::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    /// Decided automatically; kept as an archived audit entry.
    Resolved,
    /// Left for a later cycle or manual review.
    Unresolved,
}

// =============================================================================
// Inputs / Outputs
// =============================================================================

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordVersion {
    pub snapshot: Value,
    pub modified_at: Option<DateTime<Utc>>,
    pub terminal_id: String,
    pub deleted: bool,
}

impl From<&StoreRecord> for RecordVersion {
    fn from(record: &StoreRecord) -> Self {
        RecordVersion {
            snapshot: record.data.clone(),
            modified_at: Some(record.modified_at),
            terminal_id: record.modified_by.clone(),
            deleted: record.deleted,
        }
    }
}

/// Why a resolution was not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    MissingTimestamp(Winner),
    FutureTimestamp { side: Winner, ahead_secs: i64 },
}

impl std::fmt::Display for DeferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferReason::MissingTimestamp(side) => {
                write!(f, "{} version has no modification timestamp", side)
            }
            DeferReason::FutureTimestamp { side, ahead_secs } => write!(
                f,
                "{} version is {}s in the future (clock skew)",
                side, ahead_secs
            ),
        }
    }
}

/// Result of [`ConflictResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Decided {
        winner: Winner,
        /// True when timestamps were equal and terminal ids decided.
        tie_broken: bool,
    },
    Deferred(DeferReason),
}

impl Resolution {
    pub fn winner(&self) -> Option<Winner> {
        match self {
            Resolution::Decided { winner, .. } => Some(*winner),
            Resolution::Deferred(_) => None,
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::LastWriteWins
    }

    pub fn state(&self) -> ConflictState {
        match self {
            Resolution::Decided { .. } => ConflictState::Resolved,
            Resolution::Deferred(_) => ConflictState::Unresolved,
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Pure last-write-wins resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictResolver {
    max_clock_skew: Duration,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        ConflictResolver::new(Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS))
    }
}

impl ConflictResolver {
    pub fn new(max_clock_skew: Duration) -> Self {
        ConflictResolver { max_clock_skew }
    }

    pub fn resolve(
        &self,
        local: &RecordVersion,
        remote: &RecordVersion,
        now: DateTime<Utc>,
    ) -> Resolution {
        let local_at = match self.check(local, Winner::Local, now) {
            Ok(at) => at,
            Err(reason) => return Resolution::Deferred(reason),
        };
        let remote_at = match self.check(remote, Winner::Remote, now) {
            Ok(at) => at,
            Err(reason) => return Resolution::Deferred(reason),
        };

        if local_at != remote_at {
            let winner = if local_at > remote_at {
                Winner::Local
            } else {
                Winner::Remote
            };
            return Resolution::Decided {
                winner,
                tie_broken: false,
            };
        }

        let winner = if local.terminal_id < remote.terminal_id {
            Winner::Local
        } else {
            Winner::Remote
        };

        Resolution::Decided {
            winner,
            tie_broken: true,
        }
    }

    fn check(
        &self,
        version: &RecordVersion,
        side: Winner,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, DeferReason> {
        let at = version
            .modified_at
            .ok_or(DeferReason::MissingTimestamp(side))?;

        if at > now + self.max_clock_skew {
            return Err(DeferReason::FutureTimestamp {
                side,
                ahead_secs: (at - now).num_seconds(),
            });
        }

        Ok(at)
    }
}

// =============================================================================
// Conflict Record
// =============================================================================

/// Audit entry for every conflict the resolver saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictRecord {
    pub id: i64,
    pub conflict_key: String,
    pub table_name: String,
    pub record_id: String,
    #[ts(type = "unknown")]
    pub local_snapshot: Value,
    #[ts(as = "Option<String>")]
    pub local_modified_at: Option<DateTime<Utc>>,
    pub local_terminal_id: String,
    pub local_deleted: bool,
    #[ts(type = "unknown")]
    pub remote_snapshot: Value,
    #[ts(as = "Option<String>")]
    pub remote_modified_at: Option<DateTime<Utc>>,
    pub remote_terminal_id: String,
    pub remote_deleted: bool,
    pub strategy: ConflictStrategy,
    pub winner: Option<Winner>,
    pub state: ConflictState,
    pub reason: Option<String>,
    pub retry_count: i64,
    #[ts(as = "String")]
    pub detected_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn local_version(&self) -> RecordVersion {
        RecordVersion {
            snapshot: self.local_snapshot.clone(),
            modified_at: self.local_modified_at,
            terminal_id: self.local_terminal_id.clone(),
            deleted: self.local_deleted,
        }
    }

    pub fn remote_version(&self) -> RecordVersion {
        RecordVersion {
            snapshot: self.remote_snapshot.clone(),
            modified_at: self.remote_modified_at,
            terminal_id: self.remote_terminal_id.clone(),
            deleted: self.remote_deleted,
        }
    }
}

/// A conflict about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub table_name: String,
    pub record_id: String,
    pub local: RecordVersion,
    pub remote: RecordVersion,
    pub resolution: Resolution,
}

impl NewConflict {
    /// Identity of this conflict. The same pair of versions always maps to
    /// the same key, so re-running a cycle cannot record it twice.
    pub fn conflict_key(&self) -> String {
        conflict_key(
            &self.table_name,
            &self.record_id,
            self.local.modified_at,
            self.remote.modified_at,
        )
    }
}

pub fn conflict_key(
    table: &str,
    record_id: &str,
    local_at: Option<DateTime<Utc>>,
    remote_at: Option<DateTime<Utc>>,
) -> String {
    let fmt = |at: Option<DateTime<Utc>>| {
        at.map(|t| t.timestamp_millis().to_string())
            .unwrap_or_else(|| "none".to_string())
    };
    format!("{}:{}:{}:{}", table, record_id, fmt(local_at), fmt(remote_at))
}
