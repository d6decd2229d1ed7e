//! # Journal Repository
//!
//! The durable queue of writes waiting to reach the authoritative terminal.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  LOCAL OPERATION (e.g. a customer edit while offline)                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. UPSERT records (table_name, record_id)                      │   │
//! │  │  2. INSERT INTO journal_entries ... ON CONFLICT(entry_key)      │   │
//! │  │     DO NOTHING                                                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT (synchronous = FULL) ← the entry is on disk before we return   │
//! │                                                                         │
//! │  DRAIN (sync coordinator)                                              │
//! │  1. high_water = MAX(seq)                                              │
//! │  2. page: seq > cursor AND seq <= high_water AND status drainable      │
//! │  3. mark_applied / mark_failed / quarantine per entry                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An entry that can no longer be decoded is returned as
//! [`JournalRead::Corrupt`] instead of failing the whole page, so one bad
//! row never blocks the rest of the queue.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use super::record::upsert_record;
use super::{from_millis, opt_from_millis, to_millis};
use crate::error::DbResult;
use meridian_core::{
    JournalEntry, JournalEnvelope, JournalOperation, JournalStatus, NewJournalEntry, StoreRecord,
};

const SELECT_ENTRY: &str = r#"
    SELECT seq, entry_key, target_table, operation, payload, origin_terminal_id,
           created_ms, retry_count, last_attempt_ms, last_error, status, applied_ms
    FROM journal_entries
"#;

#[derive(Debug, sqlx::FromRow)]
struct JournalRow {
    seq: i64,
    entry_key: String,
    target_table: String,
    operation: JournalOperation,
    payload: String,
    origin_terminal_id: String,
    created_ms: i64,
    retry_count: i64,
    last_attempt_ms: Option<i64>,
    last_error: Option<String>,
    status: JournalStatus,
    applied_ms: Option<i64>,
}

/// A journal row as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRead {
    Entry(JournalEntry),
    /// The row exists but its payload or timestamps can't be decoded.
    Corrupt { seq: i64, reason: String },
}

impl JournalRead {
    pub fn seq(&self) -> i64 {
        match self {
            JournalRead::Entry(entry) => entry.seq,
            JournalRead::Corrupt { seq, .. } => *seq,
        }
    }
}

impl JournalRow {
    fn into_read(self) -> JournalRead {
        let seq = self.seq;
        match self.decode() {
            Ok(entry) => JournalRead::Entry(entry),
            Err(reason) => {
                warn!(seq, %reason, "Unreadable journal entry");
                JournalRead::Corrupt { seq, reason }
            }
        }
    }

    fn decode(self) -> Result<JournalEntry, String> {
        const ENTITY: &str = "journal_entry";
        let envelope = JournalEnvelope::from_json(&self.payload).map_err(|e| e.to_string())?;

        if envelope.payload.table() != self.target_table {
            return Err(format!(
                "payload targets '{}' but row targets '{}'",
                envelope.payload.table(),
                self.target_table
            ));
        }

        Ok(JournalEntry {
            created_at: from_millis(ENTITY, self.seq, self.created_ms).map_err(|e| e.to_string())?,
            last_attempt_at: opt_from_millis(ENTITY, self.seq, self.last_attempt_ms)
                .map_err(|e| e.to_string())?,
            applied_at: opt_from_millis(ENTITY, self.seq, self.applied_ms)
                .map_err(|e| e.to_string())?,
            seq: self.seq,
            entry_key: self.entry_key,
            target_table: self.target_table,
            operation: self.operation,
            envelope,
            origin_terminal_id: self.origin_terminal_id,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_error: self.last_error,
            status: self.status,
        })
    }
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub seq: i64,
    /// False when an entry with the same key was already journalled.
    pub inserted: bool,
}

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub pending: i64,
    pub failed: i64,
    pub applied: i64,
    pub dead_letter: i64,
}

impl JournalStats {
    /// Entries a drain would still attempt.
    pub fn drainable(&self) -> i64 {
        self.pending + self.failed
    }
}

/// Repository for journal entries.
#[derive(Debug, Clone)]
pub struct JournalRepository {
    pool: SqlitePool,
}

impl JournalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        JournalRepository { pool }
    }

    /// Appends an entry. Appending a key that already exists is a no-op
    /// that returns the original sequence number.
    pub async fn append(&self, entry: &NewJournalEntry, now: DateTime<Utc>) -> DbResult<Appended> {
        let mut tx = self.pool.begin().await?;
        let appended = insert_entry(&mut tx, entry, now).await?;
        tx.commit().await?;
        Ok(appended)
    }

    /// Writes the local replica row and its journal entry atomically.
    pub async fn append_with_record(
        &self,
        entry: &NewJournalEntry,
        record: &StoreRecord,
        now: DateTime<Utc>,
    ) -> DbResult<Appended> {
        let mut tx = self.pool.begin().await?;
        upsert_record(&mut *tx, record).await?;
        let appended = insert_entry(&mut tx, entry, now).await?;
        tx.commit().await?;
        Ok(appended)
    }

    /// Highest sequence number ever assigned (0 when empty).
    pub async fn high_water_seq(&self) -> DbResult<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM journal_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    /// One page of drainable entries in `(after_seq, up_to_seq]`, in
    /// sequence order, optionally restricted to one table.
    pub async fn fetch_drainable(
        &self,
        after_seq: i64,
        up_to_seq: i64,
        table: Option<&str>,
        limit: u32,
    ) -> DbResult<Vec<JournalRead>> {
        let rows: Vec<JournalRow> = sqlx::query_as(&format!(
            r#"{}
            WHERE seq > ?1 AND seq <= ?2
              AND status IN ('pending', 'failed')
              AND (?3 IS NULL OR target_table = ?3)
            ORDER BY seq ASC
            LIMIT ?4
            "#,
            SELECT_ENTRY
        ))
        .bind(after_seq)
        .bind(up_to_seq)
        .bind(table)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(JournalRow::into_read).collect())
    }

    pub async fn get(&self, seq: i64) -> DbResult<Option<JournalRead>> {
        let row: Option<JournalRow> = sqlx::query_as(&format!("{} WHERE seq = ?1", SELECT_ENTRY))
            .bind(seq)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(JournalRow::into_read))
    }

    /// Marks an entry applied. Returns false if it was not drainable, so
    /// confirming the same entry twice is harmless.
    pub async fn mark_applied(&self, seq: i64, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE journal_entries SET
                status = 'applied',
                applied_ms = ?2,
                last_attempt_ms = ?2,
                last_error = NULL
            WHERE seq = ?1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(seq)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records a failed attempt. Moves the entry to the dead letter state
    /// once `max_retries` attempts have failed.
    ///
    /// Returns the new status, or `None` if the entry was not drainable.
    pub async fn mark_failed(
        &self,
        seq: i64,
        reason: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> DbResult<Option<JournalStatus>> {
        let status: Option<JournalStatus> = sqlx::query_scalar(
            r#"
            UPDATE journal_entries SET
                retry_count = retry_count + 1,
                last_error = ?2,
                last_attempt_ms = ?4,
                status = CASE WHEN retry_count + 1 >= ?3 THEN 'dead_letter' ELSE 'failed' END
            WHERE seq = ?1 AND status IN ('pending', 'failed')
            RETURNING status
            "#,
        )
        .bind(seq)
        .bind(reason)
        .bind(i64::from(max_retries))
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        if status == Some(JournalStatus::DeadLetter) {
            warn!(seq, %reason, "Journal entry moved to dead letter");
        }

        Ok(status)
    }

    /// Sets an unreadable entry aside so it is never drained again.
    pub async fn quarantine(&self, seq: i64, reason: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE journal_entries SET
                status = 'dead_letter',
                last_error = 'corrupt: ' || ?2,
                last_attempt_ms = ?3
            WHERE seq = ?1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(seq)
        .bind(reason)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Dead-lettered entries, oldest first.
    pub async fn dead_letters(&self, limit: u32) -> DbResult<Vec<JournalRead>> {
        let rows: Vec<JournalRow> = sqlx::query_as(&format!(
            "{} WHERE status = 'dead_letter' ORDER BY seq ASC LIMIT ?1",
            SELECT_ENTRY
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(JournalRow::into_read).collect())
    }

    /// Entries still waiting to be applied (pending or failed).
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM journal_entries WHERE status IN ('pending', 'failed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn stats(&self) -> DbResult<JournalStats> {
        let rows: Vec<(JournalStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM journal_entries GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = JournalStats::default();
        for (status, count) in rows {
            match status {
                JournalStatus::Pending => stats.pending = count,
                JournalStatus::Failed => stats.failed = count,
                JournalStatus::Applied => stats.applied = count,
                JournalStatus::DeadLetter => stats.dead_letter = count,
            }
        }
        Ok(stats)
    }

    /// Deletes applied entries older than `applied_before`. Dead letters
    /// are kept for diagnostics.
    pub async fn purge_applied(&self, applied_before: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM journal_entries WHERE status = 'applied' AND applied_ms < ?1",
        )
        .bind(to_millis(applied_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &NewJournalEntry,
    now: DateTime<Utc>,
) -> DbResult<Appended> {
    let payload = entry
        .envelope
        .to_json()
        .map_err(|e| crate::error::DbError::corrupt("journal_entry", &entry.entry_key, e))?;

    let result = sqlx::query(
        r#"
        INSERT INTO journal_entries (
            entry_key, target_table, operation, payload, origin_terminal_id,
            created_ms, retry_count, status
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending')
        ON CONFLICT(entry_key) DO NOTHING
        "#,
    )
    .bind(&entry.entry_key)
    .bind(entry.target_table())
    .bind(entry.operation)
    .bind(payload)
    .bind(&entry.origin_terminal_id)
    .bind(to_millis(now))
    .execute(&mut **tx)
    .await?;

    let seq: i64 = sqlx::query_scalar("SELECT seq FROM journal_entries WHERE entry_key = ?1")
        .bind(&entry.entry_key)
        .fetch_one(&mut **tx)
        .await?;

    let inserted = result.rows_affected() == 1;
    debug!(seq, entry_key = %entry.entry_key, inserted, "Journal append");

    Ok(Appended { seq, inserted })
}
