//! # Deferred Job Repository
//!
//! Hardware work parked while the terminal is in safe mode. A job leaves
//! the `pending` state exactly once: either flushed to the device or
//! abandoned after too many failed dispatches.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{from_millis, opt_from_millis, to_millis};
use crate::error::{DbError, DbResult};
use meridian_core::{DeferredJob, DeferredJobStatus, HardwareJob, HardwareJobKind};

#[derive(Debug, sqlx::FromRow)]
struct DeferredJobRow {
    job_id: String,
    terminal_id: String,
    session_id: Option<String>,
    kind: HardwareJobKind,
    payload: String,
    status: DeferredJobStatus,
    attempts: i64,
    last_error: Option<String>,
    created_ms: i64,
    flushed_ms: Option<i64>,
}

impl DeferredJobRow {
    fn into_job(self) -> DbResult<DeferredJob> {
        const ENTITY: &str = "deferred_job";
        let id = self.job_id.as_str();
        Ok(DeferredJob {
            created_at: from_millis(ENTITY, id, self.created_ms)?,
            flushed_at: opt_from_millis(ENTITY, id, self.flushed_ms)?,
            job: HardwareJob {
                payload: serde_json::from_str(&self.payload)
                    .map_err(|e| DbError::corrupt(ENTITY, id, e))?,
                job_id: self.job_id,
                kind: self.kind,
                session_id: self.session_id,
            },
            terminal_id: self.terminal_id,
            status: self.status,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeferredJobRepository {
    pool: SqlitePool,
}

impl DeferredJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeferredJobRepository { pool }
    }

    /// Parks a job. Deferring the same job id twice is a no-op.
    pub async fn defer(
        &self,
        terminal_id: &str,
        job: &HardwareJob,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO deferred_jobs (
                job_id, terminal_id, session_id, kind, payload, status, attempts, created_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6)
            ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(&job.job_id)
        .bind(terminal_id)
        .bind(&job.session_id)
        .bind(job.kind)
        .bind(job.payload.to_string())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Pending jobs in the order they were deferred.
    pub async fn pending(&self, terminal_id: &str, limit: u32) -> DbResult<Vec<DeferredJob>> {
        let rows: Vec<DeferredJobRow> = sqlx::query_as(
            r#"
            SELECT job_id, terminal_id, session_id, kind, payload, status, attempts,
                   last_error, created_ms, flushed_ms
            FROM deferred_jobs
            WHERE terminal_id = ?1 AND status = 'pending'
            ORDER BY created_ms ASC, rowid ASC
            LIMIT ?2
            "#,
        )
        .bind(terminal_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeferredJobRow::into_job).collect()
    }

    pub async fn get(&self, job_id: &str) -> DbResult<Option<DeferredJob>> {
        let row: Option<DeferredJobRow> = sqlx::query_as(
            r#"
            SELECT job_id, terminal_id, session_id, kind, payload, status, attempts,
                   last_error, created_ms, flushed_ms
            FROM deferred_jobs
            WHERE job_id = ?1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeferredJobRow::into_job).transpose()
    }

    /// Claims a pending job as flushed. Only the first caller gets `true`.
    pub async fn mark_flushed(&self, job_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deferred_jobs SET
                status = 'flushed',
                attempts = attempts + 1,
                flushed_ms = ?2
            WHERE job_id = ?1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts a failed dispatch; the job is abandoned once `max_attempts`
    /// is reached. Returns the new status.
    pub async fn record_failure(
        &self,
        job_id: &str,
        error: &str,
        max_attempts: i64,
    ) -> DbResult<Option<DeferredJobStatus>> {
        let status: Option<DeferredJobStatus> = sqlx::query_scalar(
            r#"
            UPDATE deferred_jobs SET
                attempts = attempts + 1,
                last_error = ?2,
                status = CASE WHEN attempts + 1 >= ?3 THEN 'abandoned' ELSE 'pending' END
            WHERE job_id = ?1 AND status = 'pending'
            RETURNING status
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    pub async fn count_pending(&self, terminal_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deferred_jobs WHERE terminal_id = ?1 AND status = 'pending'",
        )
        .bind(terminal_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;

    async fn repo() -> DeferredJobRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().deferred_jobs()
    }

    #[tokio::test]
    async fn test_flush_claims_once() {
        let repo = repo().await;
        let job = HardwareJob::new(HardwareJobKind::Receipt, Some("s-1".into()), json!({ "lines": 3 }));

        assert!(repo.defer("T", &job, Utc::now()).await.unwrap());
        assert!(!repo.defer("T", &job, Utc::now()).await.unwrap());

        let pending = repo.pending("T", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job, job);

        assert!(repo.mark_flushed(&job.job_id, Utc::now()).await.unwrap());
        assert!(!repo.mark_flushed(&job.job_id, Utc::now()).await.unwrap());
        assert_eq!(repo.count_pending("T").await.unwrap(), 0);

        let stored = repo.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeferredJobStatus::Flushed);
        assert!(stored.flushed_at.is_some());
    }

    #[tokio::test]
    async fn test_abandoned_after_max_attempts() {
        let repo = repo().await;
        let job = HardwareJob::new(HardwareJobKind::CashDrawer, None, json!({}));
        repo.defer("T", &job, Utc::now()).await.unwrap();

        assert_eq!(
            repo.record_failure(&job.job_id, "paper out", 2).await.unwrap(),
            Some(DeferredJobStatus::Pending)
        );
        assert_eq!(
            repo.record_failure(&job.job_id, "paper out", 2).await.unwrap(),
            Some(DeferredJobStatus::Abandoned)
        );
        assert_eq!(repo.record_failure(&job.job_id, "x", 2).await.unwrap(), None);
        assert!(repo.pending("T", 10).await.unwrap().is_empty());
    }
}
