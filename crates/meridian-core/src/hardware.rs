//! Hardware work (receipts, print jobs, cash drawer kicks) that safe mode
//! defers until power is restored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dispatch attempts before a deferred job is abandoned.
pub const MAX_DISPATCH_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum HardwareJobKind {
    Receipt,
    PrintJob,
    CashDrawer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DeferredJobStatus {
    Pending,
    Flushed,
    Abandoned,
}

/// A unit of hardware work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareJob {
    pub job_id: String,
    pub kind: HardwareJobKind,
    /// Session the job belongs to, if any.
    pub session_id: Option<String>,
    pub payload: Value,
}

impl HardwareJob {
    pub fn new(kind: HardwareJobKind, session_id: Option<String>, payload: Value) -> Self {
        HardwareJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            kind,
            session_id,
            payload,
        }
    }
}

/// A job parked while the terminal was in safe mode.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredJob {
    pub job: HardwareJob,
    pub terminal_id: String,
    pub status: DeferredJobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub flushed_at: Option<DateTime<Utc>>,
}
