//! # Record Repository
//!
//! Replicated rows of the synchronized tables, keyed by
//! `(table_name, record_id)`. Deletions are kept as tombstones so they
//! replicate like any other change.

use sqlx::SqlitePool;

use super::{from_millis, to_millis};
use crate::error::{DbError, DbResult};
use meridian_core::{StoreRecord, SyncMarker};

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    table_name: String,
    record_id: String,
    data: String,
    modified_ms: i64,
    modified_by: String,
    deleted: bool,
}

impl RecordRow {
    fn into_record(self) -> DbResult<StoreRecord> {
        let key = format!("{}/{}", self.table_name, self.record_id);
        let data = serde_json::from_str(&self.data).map_err(|e| DbError::corrupt("record", &key, e))?;
        Ok(StoreRecord {
            modified_at: from_millis("record", &key, self.modified_ms)?,
            table_name: self.table_name,
            record_id: self.record_id,
            data,
            modified_by: self.modified_by,
            deleted: self.deleted,
        })
    }
}

/// Insert-or-replace a record through any executor, so the journal can
/// write it inside its own transaction.
pub(crate) async fn upsert_record<'e, E>(executor: E, record: &StoreRecord) -> DbResult<()>
where
    E: sqlx::SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO records (table_name, record_id, data, modified_ms, modified_by, deleted)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(table_name, record_id) DO UPDATE SET
            data = excluded.data,
            modified_ms = excluded.modified_ms,
            modified_by = excluded.modified_by,
            deleted = excluded.deleted
        "#,
    )
    .bind(&record.table_name)
    .bind(&record.record_id)
    .bind(record.data.to_string())
    .bind(to_millis(record.modified_at))
    .bind(&record.modified_by)
    .bind(record.deleted)
    .execute(executor)
    .await?;

    Ok(())
}

/// Repository for replicated records.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    pub async fn get(&self, table: &str, record_id: &str) -> DbResult<Option<StoreRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT table_name, record_id, data, modified_ms, modified_by, deleted
            FROM records
            WHERE table_name = ?1 AND record_id = ?2
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    pub async fn upsert(&self, record: &StoreRecord) -> DbResult<()> {
        upsert_record(&self.pool, record).await
    }

    /// Records of `table` strictly after `marker` in
    /// `(modified_at, record_id)` order.
    pub async fn modified_since(
        &self,
        table: &str,
        marker: &SyncMarker,
        limit: u32,
    ) -> DbResult<Vec<StoreRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT table_name, record_id, data, modified_ms, modified_by, deleted
            FROM records
            WHERE table_name = ?1
              AND (modified_ms > ?2 OR (modified_ms = ?2 AND record_id > ?3))
            ORDER BY modified_ms ASC, record_id ASC
            LIMIT ?4
            "#,
        )
        .bind(table)
        .bind(to_millis(marker.modified_at))
        .bind(&marker.record_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    pub async fn count(&self, table: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE table_name = ?1")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(id: &str, ms: i64) -> StoreRecord {
        StoreRecord {
            table_name: "products".into(),
            record_id: id.into(),
            data: json!({ "sku": id, "price_cents": 250 }),
            modified_at: Utc.timestamp_millis_opt(ms).unwrap(),
            modified_by: "TERM-A".into(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let repo = Database::new(DbConfig::in_memory()).await.unwrap().records();
        repo.upsert(&record("p-1", 1_000)).await.unwrap();

        let mut newer = record("p-1", 2_000);
        newer.deleted = true;
        repo.upsert(&newer).await.unwrap();

        assert_eq!(repo.get("products", "p-1").await.unwrap(), Some(newer));
        assert_eq!(repo.count("products").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_modified_since_resumes_inside_equal_timestamps() {
        let repo = Database::new(DbConfig::in_memory()).await.unwrap().records();
        for (id, ms) in [("p-1", 1_000), ("p-2", 1_000), ("p-3", 1_000), ("p-0", 2_000)] {
            repo.upsert(&record(id, ms)).await.unwrap();
        }

        let first = repo.modified_since("products", &SyncMarker::origin(), 2).await.unwrap();
        let ids: Vec<&str> = first.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, ["p-1", "p-2"]);

        let marker = first.last().unwrap().marker();
        let rest = repo.modified_since("products", &marker, 10).await.unwrap();
        let ids: Vec<&str> = rest.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, ["p-3", "p-0"]);
    }
}
