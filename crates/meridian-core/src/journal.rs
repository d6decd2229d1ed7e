//! # Journal Types
//!
//! The durable local queue of writes a terminal produces while it cannot
//! reach the authoritative terminal, and the typed envelope those writes
//! are carried in.
//!
//! ## Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   enqueue ──► PENDING ──► markApplied ──────────────► APPLIED           │
//! │                  │                                                      │
//! │                  ▼ markFailed (retry_count += 1)                        │
//! │               FAILED ──► retried next drain ──► APPLIED                 │
//! │                  │                                                      │
//! │                  ▼ retry_count == max_retries                           │
//! │             DEAD_LETTER  (kept for diagnostics, never drained again)   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::record::{tables, StoreRecord};
use crate::storage_precision;

/// Newest envelope layout this build writes and understands.
pub const JOURNAL_ENVELOPE_VERSION: u32 = 1;

/// Failed attempts before an entry is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// =============================================================================
// Status / Operation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum JournalOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum JournalStatus {
    Pending,
    Applied,
    /// Failed at least once; still eligible for draining.
    Failed,
    /// Exceeded max retries or was unreadable. Never drained again.
    DeadLetter,
}

impl JournalStatus {
    /// Whether a drain should still attempt this entry.
    pub fn is_drainable(&self) -> bool {
        matches!(self, JournalStatus::Pending | JournalStatus::Failed)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Snapshot of a single row in one of the synchronized tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub record_id: String,
    pub data: Value,
    pub modified_at: DateTime<Utc>,
}

/// One line of a sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// A completed sale as captured on the terminal that rang it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleSnapshot {
    pub sale_id: String,
    pub receipt_number: String,
    pub total_cents: i64,
    pub lines: Vec<SaleLine>,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Known kinds of journalled writes.
///
/// ## Wire Format
/// ```json
/// { "kind": "customer_update", "record_id": "c-1", "data": {...}, "modified_at": "..." }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalPayload {
    Sale(SaleSnapshot),
    CustomerUpdate(RecordSnapshot),
    ProductUpdate(RecordSnapshot),
    SupplierUpdate(RecordSnapshot),
    CategoryUpdate(RecordSnapshot),
}

impl JournalPayload {
    /// Table this payload is applied to.
    pub fn table(&self) -> &'static str {
        match self {
            JournalPayload::Sale(_) => tables::SALES,
            JournalPayload::CustomerUpdate(_) => tables::CUSTOMERS,
            JournalPayload::ProductUpdate(_) => tables::PRODUCTS,
            JournalPayload::SupplierUpdate(_) => tables::SUPPLIERS,
            JournalPayload::CategoryUpdate(_) => tables::CATEGORIES,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            JournalPayload::Sale(s) => &s.sale_id,
            JournalPayload::CustomerUpdate(r)
            | JournalPayload::ProductUpdate(r)
            | JournalPayload::SupplierUpdate(r)
            | JournalPayload::CategoryUpdate(r) => &r.record_id,
        }
    }

    /// Local modification time carried by the payload.
    pub fn modified_at(&self) -> DateTime<Utc> {
        match self {
            JournalPayload::Sale(s) => s.completed_at,
            JournalPayload::CustomerUpdate(r)
            | JournalPayload::ProductUpdate(r)
            | JournalPayload::SupplierUpdate(r)
            | JournalPayload::CategoryUpdate(r) => r.modified_at,
        }
    }

    /// Builds the replica record this payload writes.
    pub fn to_record(&self, operation: JournalOperation, origin: &str) -> CoreResult<StoreRecord> {
        let data = match self {
            JournalPayload::Sale(s) => serde_json::to_value(s)?,
            JournalPayload::CustomerUpdate(r)
            | JournalPayload::ProductUpdate(r)
            | JournalPayload::SupplierUpdate(r)
            | JournalPayload::CategoryUpdate(r) => r.data.clone(),
        };

        Ok(StoreRecord {
            table_name: self.table().to_string(),
            record_id: self.record_id().to_string(),
            data,
            modified_at: storage_precision(self.modified_at()),
            modified_by: origin.to_string(),
            deleted: operation == JournalOperation::Delete,
        })
    }
}

/// Versioned wrapper persisted in the journal's payload column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEnvelope {
    pub version: u32,
    pub payload: JournalPayload,
}

impl JournalEnvelope {
    pub fn new(payload: JournalPayload) -> Self {
        JournalEnvelope {
            version: JOURNAL_ENVELOPE_VERSION,
            payload,
        }
    }

    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a stored envelope, rejecting layouts from newer builds.
    pub fn from_json(raw: &str) -> CoreResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| CoreError::MalformedPayload("missing envelope version".into()))?;

        if version > u64::from(JOURNAL_ENVELOPE_VERSION) {
            return Err(CoreError::UnsupportedEnvelopeVersion {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                supported: JOURNAL_ENVELOPE_VERSION,
            });
        }

        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// Journal Entry
// =============================================================================

/// A journalled write as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Local, monotonically increasing sequence number.
    pub seq: i64,
    /// Idempotency key supplied at enqueue time.
    pub entry_key: String,
    pub target_table: String,
    pub operation: JournalOperation,
    pub envelope: JournalEnvelope,
    pub origin_terminal_id: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: JournalStatus,
    pub applied_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    pub fn to_record(&self) -> CoreResult<StoreRecord> {
        self.envelope
            .payload
            .to_record(self.operation, &self.origin_terminal_id)
    }
}

/// A write about to be appended to the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJournalEntry {
    pub entry_key: String,
    pub operation: JournalOperation,
    pub envelope: JournalEnvelope,
    pub origin_terminal_id: String,
}

impl NewJournalEntry {
    /// Creates an entry with a fresh idempotency key.
    pub fn new(operation: JournalOperation, payload: JournalPayload, origin: impl Into<String>) -> Self {
        NewJournalEntry {
            entry_key: uuid::Uuid::new_v4().to_string(),
            operation,
            envelope: JournalEnvelope::new(payload),
            origin_terminal_id: origin.into(),
        }
    }

    /// Overrides the idempotency key (e.g. the caller's own transaction id).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.entry_key = key.into();
        self
    }

    pub fn target_table(&self) -> &'static str {
        self.envelope.payload.table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn customer(id: &str) -> JournalPayload {
        JournalPayload::CustomerUpdate(RecordSnapshot {
            record_id: id.into(),
            data: json!({ "name": "Nimal", "phone": "0771234567" }),
            modified_at: Utc::now(),
        })
    }

    #[test]
    fn test_envelope_is_tagged_by_kind() {
        let raw = JournalEnvelope::new(customer("c-1")).to_json().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["version"], 1);
        assert_eq!(value["payload"]["kind"], "customer_update");
        assert_eq!(value["payload"]["record_id"], "c-1");
    }

    #[test]
    fn test_newer_envelope_is_rejected() {
        let raw = r#"{"version": 9, "payload": {"kind": "customer_update"}}"#;
        let err = JournalEnvelope::from_json(raw).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnsupportedEnvelopeVersion { found: 9, supported: 1 }
        ));
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let raw = r#"{"version": 1, "payload": {"kind": "gift_card", "record_id": "g"}}"#;
        assert!(matches!(
            JournalEnvelope::from_json(raw),
            Err(CoreError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_delete_builds_tombstone() {
        let record = customer("c-9")
            .to_record(JournalOperation::Delete, "TERM-B")
            .unwrap();
        assert_eq!(record.table_name, "customers");
        assert!(record.deleted);
        assert_eq!(record.modified_by, "TERM-B");
    }

    #[test]
    fn test_sale_targets_sales_table() {
        let sale = JournalPayload::Sale(SaleSnapshot {
            sale_id: "s-1".into(),
            receipt_number: "R-0001".into(),
            total_cents: 1250,
            lines: vec![SaleLine {
                product_id: "p-1".into(),
                quantity: 2,
                unit_price_cents: 625,
            }],
            customer_id: None,
            completed_at: Utc::now(),
        });
        let record = sale.to_record(JournalOperation::Insert, "TERM-B").unwrap();
        assert_eq!(record.table_name, "sales");
        assert_eq!(record.data["receipt_number"], "R-0001");
        assert!(!record.deleted);
    }

    #[test]
    fn test_drainable_statuses() {
        assert!(JournalStatus::Pending.is_drainable());
        assert!(JournalStatus::Failed.is_drainable());
        assert!(!JournalStatus::Applied.is_drainable());
        assert!(!JournalStatus::DeadLetter.is_drainable());
    }
}
