//! # Transaction Checkpoints
//!
//! Auto-saved state of an in-flight transaction, so a sale interrupted by a
//! power cut can be resumed or discarded after restart.
//!
//! ## Lifecycle
//! ```text
//!   save ──► ACTIVE ──save──► ACTIVE (auto_save_count += 1)
//!              │
//!              ├── complete ─────────────► COMPLETED ┐
//!              ├── markRecovered(true) ──► RECOVERED ├─► purged after retention
//!              └── markRecovered(false) ─► FAILED    ┘
//!
//!   ACTIVE rows are never purged, however old.
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::journal::SaleLine;

/// Envelope version written for transaction snapshots.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Retention for finished checkpoints, in hours.
pub const DEFAULT_CHECKPOINT_RETENTION_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Active,
    Recovered,
    Failed,
    Completed,
}

impl CheckpointState {
    /// Terminal states are eligible for the retention sweep.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointState::Active)
    }
}

/// Typed state of an in-flight transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionSnapshot {
    Sale {
        lines: Vec<SaleLine>,
        #[serde(default)]
        customer_id: Option<String>,
        #[serde(default)]
        tendered_cents: i64,
        /// Free-form step name, e.g. `payment_pending`.
        step: String,
    },
    Return {
        original_sale_id: String,
        lines: Vec<SaleLine>,
        step: String,
    },
    /// Transaction kinds this build does not model explicitly.
    Other { kind_name: String, state: Value },
}

impl TransactionSnapshot {
    pub fn transaction_type(&self) -> &str {
        match self {
            TransactionSnapshot::Sale { .. } => "sale",
            TransactionSnapshot::Return { .. } => "return",
            TransactionSnapshot::Other { kind_name, .. } => kind_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    snapshot: TransactionSnapshot,
}

/// Encodes a snapshot with its envelope version.
pub fn encode_snapshot(snapshot: &TransactionSnapshot) -> CoreResult<String> {
    Ok(serde_json::to_string(&SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        snapshot: snapshot.clone(),
    })?)
}

pub fn decode_snapshot(raw: &str) -> CoreResult<TransactionSnapshot> {
    let envelope: SnapshotEnvelope = serde_json::from_str(raw)?;
    if envelope.version > SNAPSHOT_VERSION {
        return Err(CoreError::UnsupportedEnvelopeVersion {
            found: envelope.version,
            supported: SNAPSHOT_VERSION,
        });
    }
    Ok(envelope.snapshot)
}

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCheckpoint {
    pub session_id: String,
    pub terminal_id: String,
    pub transaction_type: String,
    pub snapshot: TransactionSnapshot,
    pub last_action: String,
    pub auto_save_count: i64,
    pub state: CheckpointState,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    pub recovery_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
