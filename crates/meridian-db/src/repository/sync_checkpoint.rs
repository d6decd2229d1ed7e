//! # Sync Checkpoint Repository
//!
//! Per-(terminal, table) marker of the last record pulled. Markers only
//! move forward: an `advance` to an older or equal marker is ignored.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{from_millis, to_millis};
use crate::error::DbResult;
use meridian_core::{SyncCheckpoint, SyncMarker};

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    terminal_id: String,
    table_name: String,
    marker_ms: i64,
    marker_record_id: String,
    updated_ms: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> DbResult<SyncCheckpoint> {
        let key = format!("{}/{}", self.terminal_id, self.table_name);
        Ok(SyncCheckpoint {
            marker: SyncMarker {
                modified_at: from_millis("sync_checkpoint", &key, self.marker_ms)?,
                record_id: self.marker_record_id,
            },
            updated_at: from_millis("sync_checkpoint", &key, self.updated_ms)?,
            terminal_id: self.terminal_id,
            table_name: self.table_name,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncCheckpointRepository {
    pool: SqlitePool,
}

impl SyncCheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncCheckpointRepository { pool }
    }

    pub async fn get(&self, terminal_id: &str, table: &str) -> DbResult<Option<SyncCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT terminal_id, table_name, marker_ms, marker_record_id, updated_ms
            FROM sync_checkpoints
            WHERE terminal_id = ?1 AND table_name = ?2
            "#,
        )
        .bind(terminal_id)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Marker for a table, or the origin if it never synced.
    pub async fn marker(&self, terminal_id: &str, table: &str) -> DbResult<SyncMarker> {
        Ok(self
            .get(terminal_id, table)
            .await?
            .map(|c| c.marker)
            .unwrap_or_default())
    }

    /// Moves the marker forward. Returns false when `marker` does not sort
    /// after the stored one.
    pub async fn advance(
        &self,
        terminal_id: &str,
        table: &str,
        marker: &SyncMarker,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (terminal_id, table_name, marker_ms, marker_record_id, updated_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(terminal_id, table_name) DO UPDATE SET
                marker_ms = excluded.marker_ms,
                marker_record_id = excluded.marker_record_id,
                updated_ms = excluded.updated_ms
            WHERE excluded.marker_ms > sync_checkpoints.marker_ms
               OR (excluded.marker_ms = sync_checkpoints.marker_ms
                   AND excluded.marker_record_id > sync_checkpoints.marker_record_id)
            "#,
        )
        .bind(terminal_id)
        .bind(table)
        .bind(to_millis(marker.modified_at))
        .bind(&marker.record_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, terminal_id: &str) -> DbResult<Vec<SyncCheckpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT terminal_id, table_name, marker_ms, marker_record_id, updated_ms
            FROM sync_checkpoints
            WHERE terminal_id = ?1
            ORDER BY table_name
            "#,
        )
        .bind(terminal_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::TimeZone;

    fn marker(ms: i64, id: &str) -> SyncMarker {
        SyncMarker {
            modified_at: Utc.timestamp_millis_opt(ms).unwrap(),
            record_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_markers_only_advance() {
        let repo = Database::new(DbConfig::in_memory()).await.unwrap().sync_checkpoints();
        assert_eq!(repo.marker("TERM-B", "customers").await.unwrap(), SyncMarker::origin());

        assert!(repo.advance("TERM-B", "customers", &marker(5_000, "c-2"), Utc::now()).await.unwrap());
        assert!(repo.advance("TERM-B", "customers", &marker(5_000, "c-3"), Utc::now()).await.unwrap());

        // Older or equal markers are ignored
        assert!(!repo.advance("TERM-B", "customers", &marker(5_000, "c-1"), Utc::now()).await.unwrap());
        assert!(!repo.advance("TERM-B", "customers", &marker(4_000, "c-9"), Utc::now()).await.unwrap());
        assert!(!repo.advance("TERM-B", "customers", &marker(5_000, "c-3"), Utc::now()).await.unwrap());

        assert_eq!(repo.marker("TERM-B", "customers").await.unwrap(), marker(5_000, "c-3"));
        assert_eq!(repo.list("TERM-B").await.unwrap().len(), 1);
    }
}
