//! # Conflict Repository
//!
//! Audit log of every conflict the resolver has seen. Each conflict is keyed
//! by its `conflict_key`, so re-running a sync cycle over the same pair of
//! versions never records it twice.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::{from_millis, opt_from_millis, to_millis};
use crate::error::{DbError, DbResult};
use meridian_core::{
    ConflictRecord, ConflictState, ConflictStrategy, NewConflict, Resolution, Winner,
};

const SELECT_CONFLICT: &str = r#"
    SELECT id, conflict_key, table_name, record_id,
           local_snapshot, local_modified_ms, local_terminal_id, local_deleted,
           remote_snapshot, remote_modified_ms, remote_terminal_id, remote_deleted,
           strategy, winner, state, reason, retry_count, detected_ms, resolved_ms
    FROM sync_conflicts
"#;

#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: i64,
    conflict_key: String,
    table_name: String,
    record_id: String,
    local_snapshot: String,
    local_modified_ms: Option<i64>,
    local_terminal_id: String,
    local_deleted: bool,
    remote_snapshot: String,
    remote_modified_ms: Option<i64>,
    remote_terminal_id: String,
    remote_deleted: bool,
    strategy: ConflictStrategy,
    winner: Option<Winner>,
    state: ConflictState,
    reason: Option<String>,
    retry_count: i64,
    detected_ms: i64,
    resolved_ms: Option<i64>,
}

impl ConflictRow {
    fn into_record(self) -> DbResult<ConflictRecord> {
        const ENTITY: &str = "sync_conflict";
        let id = self.id;
        let json = |raw: &str| -> DbResult<serde_json::Value> {
            serde_json::from_str(raw).map_err(|e| DbError::corrupt(ENTITY, id, e))
        };

        Ok(ConflictRecord {
            local_snapshot: json(&self.local_snapshot)?,
            remote_snapshot: json(&self.remote_snapshot)?,
            local_modified_at: opt_from_millis(ENTITY, id, self.local_modified_ms)?,
            remote_modified_at: opt_from_millis(ENTITY, id, self.remote_modified_ms)?,
            detected_at: from_millis(ENTITY, id, self.detected_ms)?,
            resolved_at: opt_from_millis(ENTITY, id, self.resolved_ms)?,
            id,
            conflict_key: self.conflict_key,
            table_name: self.table_name,
            record_id: self.record_id,
            local_terminal_id: self.local_terminal_id,
            local_deleted: self.local_deleted,
            remote_terminal_id: self.remote_terminal_id,
            remote_deleted: self.remote_deleted,
            strategy: self.strategy,
            winner: self.winner,
            state: self.state,
            reason: self.reason,
            retry_count: self.retry_count,
        })
    }
}

fn resolution_reason(resolution: &Resolution) -> Option<String> {
    match resolution {
        Resolution::Decided {
            tie_broken: true, ..
        } => Some("equal timestamps, decided by terminal id".to_string()),
        Resolution::Decided { .. } => None,
        Resolution::Deferred(reason) => Some(reason.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    /// Records a conflict and its resolution.
    ///
    /// ## Returns
    /// The stored record and whether this call created it. A conflict with
    /// the same key is left untouched.
    pub async fn record(
        &self,
        conflict: &NewConflict,
        now: DateTime<Utc>,
    ) -> DbResult<(ConflictRecord, bool)> {
        let key = conflict.conflict_key();
        let state = conflict.resolution.state();
        let resolved_ms = (state == ConflictState::Resolved).then(|| to_millis(now));

        let result = sqlx::query(
            r#"
            INSERT INTO sync_conflicts (
                conflict_key, table_name, record_id,
                local_snapshot, local_modified_ms, local_terminal_id, local_deleted,
                remote_snapshot, remote_modified_ms, remote_terminal_id, remote_deleted,
                strategy, winner, state, reason, retry_count, detected_ms, resolved_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, ?16, ?17)
            ON CONFLICT(conflict_key) DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(&conflict.table_name)
        .bind(&conflict.record_id)
        .bind(conflict.local.snapshot.to_string())
        .bind(conflict.local.modified_at.map(to_millis))
        .bind(&conflict.local.terminal_id)
        .bind(conflict.local.deleted)
        .bind(conflict.remote.snapshot.to_string())
        .bind(conflict.remote.modified_at.map(to_millis))
        .bind(&conflict.remote.terminal_id)
        .bind(conflict.remote.deleted)
        .bind(conflict.resolution.strategy())
        .bind(conflict.resolution.winner())
        .bind(state)
        .bind(resolution_reason(&conflict.resolution))
        .bind(to_millis(now))
        .bind(resolved_ms)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        debug!(conflict_key = %key, created, ?state, "Conflict recorded");

        let record = self
            .get_by_key(&key)
            .await?
            .ok_or_else(|| DbError::not_found("Conflict", &key))?;

        Ok((record, created))
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<ConflictRecord>> {
        let row: Option<ConflictRow> = sqlx::query_as(&format!("{} WHERE id = ?1", SELECT_CONFLICT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ConflictRow::into_record).transpose()
    }

    pub async fn get_by_key(&self, conflict_key: &str) -> DbResult<Option<ConflictRecord>> {
        let row: Option<ConflictRow> =
            sqlx::query_as(&format!("{} WHERE conflict_key = ?1", SELECT_CONFLICT))
                .bind(conflict_key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ConflictRow::into_record).transpose()
    }

    /// Unresolved conflicts that have been retried fewer than
    /// `max_retries` times, oldest first.
    pub async fn retryable(&self, max_retries: u32, limit: u32) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            r#"{}
            WHERE state = 'unresolved' AND retry_count < ?1
            ORDER BY detected_ms ASC, id ASC
            LIMIT ?2
            "#,
            SELECT_CONFLICT
        ))
        .bind(i64::from(max_retries))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    /// All unresolved conflicts, oldest first.
    pub async fn unresolved(&self, limit: u32) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            "{} WHERE state = 'unresolved' ORDER BY detected_ms ASC, id ASC LIMIT ?1",
            SELECT_CONFLICT
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    /// Most recent conflicts first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            "{} ORDER BY detected_ms DESC, id DESC LIMIT ?1",
            SELECT_CONFLICT
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    /// Resolves a previously unresolved conflict.
    pub async fn mark_resolved(
        &self,
        id: i64,
        winner: Winner,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_conflicts SET
                state = 'resolved',
                winner = ?2,
                reason = COALESCE(?3, reason),
                resolved_ms = ?4
            WHERE id = ?1 AND state = 'unresolved'
            "#,
        )
        .bind(id)
        .bind(winner)
        .bind(reason)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts another failed attempt. Returns the new retry count.
    pub async fn record_retry(&self, id: i64, reason: &str) -> DbResult<Option<i64>> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sync_conflicts SET retry_count = retry_count + 1, reason = ?2
            WHERE id = ?1 AND state = 'unresolved'
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn count_unresolved(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_conflicts WHERE state = 'unresolved'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
