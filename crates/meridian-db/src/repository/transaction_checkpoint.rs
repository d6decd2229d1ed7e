//! # Transaction Checkpoint Repository
//!
//! Auto-saved state of in-flight transactions, one row per
//! (terminal, session).
//!
//! ```text
//!   save (new)        → INSERT, auto_save_count = 1
//!   save (active)     → UPDATE, auto_save_count += 1
//!   save (recovered)  → UPDATE, state back to active
//!   save (completed / failed) → ignored, returns None
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use super::{from_millis, to_millis};
use crate::error::{DbError, DbResult};
use meridian_core::checkpoint::{decode_snapshot, encode_snapshot};
use meridian_core::{CheckpointState, TransactionCheckpoint, TransactionSnapshot};

const SELECT_CHECKPOINT: &str = r#"
    SELECT terminal_id, session_id, transaction_type, snapshot, last_action,
           auto_save_count, state, recovery_attempted, recovery_successful,
           recovery_notes, created_ms, updated_ms, expires_ms
    FROM transaction_checkpoints
"#;

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    terminal_id: String,
    session_id: String,
    transaction_type: String,
    snapshot: String,
    last_action: String,
    auto_save_count: i64,
    state: CheckpointState,
    recovery_attempted: bool,
    recovery_successful: bool,
    recovery_notes: Option<String>,
    created_ms: i64,
    updated_ms: i64,
    expires_ms: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> DbResult<TransactionCheckpoint> {
        const ENTITY: &str = "transaction_checkpoint";
        let id = self.session_id.as_str();
        Ok(TransactionCheckpoint {
            snapshot: decode_snapshot(&self.snapshot).map_err(|e| DbError::corrupt(ENTITY, id, e))?,
            created_at: from_millis(ENTITY, id, self.created_ms)?,
            updated_at: from_millis(ENTITY, id, self.updated_ms)?,
            expires_at: from_millis(ENTITY, id, self.expires_ms)?,
            session_id: self.session_id,
            terminal_id: self.terminal_id,
            transaction_type: self.transaction_type,
            last_action: self.last_action,
            auto_save_count: self.auto_save_count,
            state: self.state,
            recovery_attempted: self.recovery_attempted,
            recovery_successful: self.recovery_successful,
            recovery_notes: self.recovery_notes,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransactionCheckpointRepository {
    pool: SqlitePool,
}

impl TransactionCheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        TransactionCheckpointRepository { pool }
    }

    /// Upserts the checkpoint for a session.
    ///
    /// ## Returns
    /// The new `auto_save_count`, or `None` if the session is already
    /// completed or failed.
    pub async fn save(
        &self,
        terminal_id: &str,
        session_id: &str,
        snapshot: &TransactionSnapshot,
        last_action: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<Option<i64>> {
        let encoded = encode_snapshot(snapshot)
            .map_err(|e| DbError::corrupt("transaction_checkpoint", session_id, e))?;

        let count: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO transaction_checkpoints (
                terminal_id, session_id, transaction_type, snapshot, last_action,
                auto_save_count, state, created_ms, updated_ms, expires_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1, 'active', ?6, ?6, ?7)
            ON CONFLICT(terminal_id, session_id) DO UPDATE SET
                transaction_type = excluded.transaction_type,
                snapshot = excluded.snapshot,
                last_action = excluded.last_action,
                auto_save_count = transaction_checkpoints.auto_save_count + 1,
                state = 'active',
                updated_ms = excluded.updated_ms,
                expires_ms = excluded.expires_ms
            WHERE transaction_checkpoints.state IN ('active', 'recovered')
            RETURNING auto_save_count
            "#,
        )
        .bind(terminal_id)
        .bind(session_id)
        .bind(snapshot.transaction_type())
        .bind(encoded)
        .bind(last_action)
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .fetch_optional(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn get(
        &self,
        terminal_id: &str,
        session_id: &str,
    ) -> DbResult<Option<TransactionCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "{} WHERE terminal_id = ?1 AND session_id = ?2",
            SELECT_CHECKPOINT
        ))
        .bind(terminal_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Active checkpoints no one has tried to recover yet, oldest first.
    /// Rows whose snapshot can't be decoded are logged and skipped.
    pub async fn list_pending(&self, terminal_id: &str) -> DbResult<Vec<TransactionCheckpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            r#"{}
            WHERE terminal_id = ?1 AND state = 'active' AND recovery_attempted = 0
            ORDER BY updated_ms ASC, session_id ASC
            "#,
            SELECT_CHECKPOINT
        ))
        .bind(terminal_id)
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_checkpoint() {
                Ok(checkpoint) => pending.push(checkpoint),
                Err(e) => warn!(error = %e, "Skipping unreadable transaction checkpoint"),
            }
        }
        Ok(pending)
    }

    pub async fn count_active(&self, terminal_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transaction_checkpoints WHERE terminal_id = ?1 AND state = 'active'",
        )
        .bind(terminal_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Records the outcome of a recovery attempt on an active checkpoint.
    pub async fn mark_recovered(
        &self,
        terminal_id: &str,
        session_id: &str,
        successful: bool,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let state = if successful {
            CheckpointState::Recovered
        } else {
            CheckpointState::Failed
        };

        let result = sqlx::query(
            r#"
            UPDATE transaction_checkpoints SET
                state = ?3,
                recovery_attempted = 1,
                recovery_successful = ?4,
                recovery_notes = ?5,
                updated_ms = ?6
            WHERE terminal_id = ?1 AND session_id = ?2 AND state = 'active'
            "#,
        )
        .bind(terminal_id)
        .bind(session_id)
        .bind(state)
        .bind(successful)
        .bind(notes)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn complete(
        &self,
        terminal_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_checkpoints SET state = 'completed', updated_ms = ?3
            WHERE terminal_id = ?1 AND session_id = ?2 AND state IN ('active', 'recovered')
            "#,
        )
        .bind(terminal_id)
        .bind(session_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes finished checkpoints last touched before `updated_before`.
    /// Active checkpoints are never deleted.
    pub async fn purge_closed(&self, updated_before: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM transaction_checkpoints
            WHERE state IN ('recovered', 'failed', 'completed') AND updated_ms < ?1
            "#,
        )
        .bind(to_millis(updated_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;
    use meridian_core::SaleLine;

    fn sale(step: &str) -> TransactionSnapshot {
        TransactionSnapshot::Sale {
            lines: vec![SaleLine {
                product_id: "p-1".into(),
                quantity: 2,
                unit_price_cents: 300,
            }],
            customer_id: None,
            tendered_cents: 0,
            step: step.into(),
        }
    }

    async fn repo() -> TransactionCheckpointRepository {
        Database::new(DbConfig::in_memory())
            .await
            .unwrap()
            .transaction_checkpoints()
    }

    #[tokio::test]
    async fn test_save_counts_auto_saves() {
        let repo = repo().await;
        let now = Utc::now();
        let expires = now + Duration::hours(48);

        assert_eq!(repo.save("T", "s-1", &sale("scan"), "add_item", now, expires).await.unwrap(), Some(1));
        assert_eq!(repo.save("T", "s-1", &sale("pay"), "tender", now, expires).await.unwrap(), Some(2));

        let stored = repo.get("T", "s-1").await.unwrap().unwrap();
        assert_eq!(stored.auto_save_count, 2);
        assert_eq!(stored.last_action, "tender");
        assert_eq!(stored.snapshot, sale("pay"));
        assert_eq!(stored.transaction_type, "sale");
        assert_eq!(repo.count_active("T").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_save() {
        let repo = repo().await;
        let now = Utc::now();
        repo.save("T", "s-1", &sale("scan"), "add_item", now, now).await.unwrap();
        assert!(repo.complete("T", "s-1", now).await.unwrap());

        assert_eq!(repo.save("T", "s-1", &sale("scan"), "add_item", now, now).await.unwrap(), None);
        assert_eq!(
            repo.get("T", "s-1").await.unwrap().unwrap().state,
            CheckpointState::Completed
        );
    }

    #[tokio::test]
    async fn test_recovery_outcomes() {
        let repo = repo().await;
        let now = Utc::now();
        repo.save("T", "ok", &sale("scan"), "a", now, now).await.unwrap();
        repo.save("T", "bad", &sale("scan"), "a", now, now).await.unwrap();
        assert_eq!(repo.list_pending("T").await.unwrap().len(), 2);

        assert!(repo.mark_recovered("T", "ok", true, Some("resumed"), now).await.unwrap());
        assert!(repo.mark_recovered("T", "bad", false, Some("cart lost"), now).await.unwrap());
        assert!(repo.list_pending("T").await.unwrap().is_empty());

        // A recovered session continues; it does not become pending again
        assert_eq!(repo.save("T", "ok", &sale("pay"), "b", now, now).await.unwrap(), Some(2));
        let resumed = repo.get("T", "ok").await.unwrap().unwrap();
        assert_eq!(resumed.state, CheckpointState::Active);
        assert!(resumed.recovery_attempted && resumed.recovery_successful);
        assert!(repo.list_pending("T").await.unwrap().is_empty());

        let failed = repo.get("T", "bad").await.unwrap().unwrap();
        assert_eq!(failed.state, CheckpointState::Failed);
        assert_eq!(failed.recovery_notes.as_deref(), Some("cart lost"));
    }

    #[tokio::test]
    async fn test_purge_never_touches_active() {
        let repo = repo().await;
        let old = Utc::now() - Duration::hours(100);
        repo.save("T", "active", &sale("scan"), "a", old, old).await.unwrap();
        repo.save("T", "done", &sale("scan"), "a", old, old).await.unwrap();
        repo.complete("T", "done", old).await.unwrap();

        let purged = repo.purge_closed(Utc::now() - Duration::hours(48)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get("T", "active").await.unwrap().is_some());
        assert!(repo.get("T", "done").await.unwrap().is_none());
    }
}
