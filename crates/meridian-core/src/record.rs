//! # Replicated Records and Sync Markers
//!
//! The shape every synchronized table row takes on the wire, and the
//! per-table marker that bounds delta queries.
//!
//! ## Marker Ordering
//! ```text
//! Records are pulled in (modified_at, record_id) order. The marker stores
//! both parts so a batch that stops between two rows with the same
//! timestamp resumes at the right one.
//!
//!   (10:00:00, c-1) (10:00:00, c-2) │ (10:00:00, c-3) (10:00:05, c-1)
//!                                   ▲
//!                         marker = (10:00:00, c-2)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tables that take part in synchronization.
pub mod tables {
    pub const PRODUCTS: &str = "products";
    pub const CUSTOMERS: &str = "customers";
    pub const SUPPLIERS: &str = "suppliers";
    pub const CATEGORIES: &str = "categories";
    pub const SALES: &str = "sales";

    /// Default set pulled on every cycle.
    pub const ALL: [&str; 5] = [PRODUCTS, CUSTOMERS, SUPPLIERS, CATEGORIES, SALES];

    pub fn is_known(table: &str) -> bool {
        ALL.contains(&table)
    }
}

/// A row of a synchronized table. Deletions travel as tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub table_name: String,
    pub record_id: String,
    pub data: Value,
    pub modified_at: DateTime<Utc>,
    /// Terminal that produced this version.
    pub modified_by: String,
    pub deleted: bool,
}

impl StoreRecord {
    /// Same content regardless of which terminal wrote it.
    pub fn same_content(&self, other: &StoreRecord) -> bool {
        self.data == other.data && self.deleted == other.deleted
    }

    /// Same version: content, timestamp and author all match.
    pub fn same_version(&self, other: &StoreRecord) -> bool {
        self.same_content(other)
            && self.modified_at == other.modified_at
            && self.modified_by == other.modified_by
    }

    pub fn marker(&self) -> SyncMarker {
        SyncMarker {
            modified_at: self.modified_at,
            record_id: self.record_id.clone(),
        }
    }
}

/// Position in a table's `(modified_at, record_id)` ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncMarker {
    pub modified_at: DateTime<Utc>,
    pub record_id: String,
}

impl SyncMarker {
    /// Marker before every record, used when a table has never synced.
    pub fn origin() -> Self {
        SyncMarker {
            modified_at: DateTime::<Utc>::default(),
            record_id: String::new(),
        }
    }

    /// True when `record` sorts strictly after this marker.
    pub fn precedes(&self, record: &StoreRecord) -> bool {
        (self.modified_at, self.record_id.as_str()) < (record.modified_at, record.record_id.as_str())
    }
}

impl Default for SyncMarker {
    fn default() -> Self {
        SyncMarker::origin()
    }
}

/// Last successfully synchronized position for one (terminal, table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub terminal_id: String,
    pub table_name: String,
    pub marker: SyncMarker,
    pub updated_at: DateTime<Utc>,
}
