//! Access to the authoritative copy of the synchronized tables.
//!
//! The coordinator only sees the [`RecordStore`] trait. On the
//! authoritative terminal the store is its own database; a satellite opens
//! the authoritative database through the shared data path.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use meridian_core::{StoreRecord, SyncMarker};
use meridian_db::{migrations, Database, DbConfig, DbError, RecordRepository};

use crate::error::{SyncError, SyncResult};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records of `table` sorting after `marker`, in `(modified_at, record_id)` order.
    async fn modified_since(
        &self,
        table: &str,
        marker: &SyncMarker,
        limit: u32,
    ) -> SyncResult<Vec<StoreRecord>>;

    async fn get(&self, table: &str, record_id: &str) -> SyncResult<Option<StoreRecord>>;

    /// Writes a record; deletions arrive as tombstones.
    async fn upsert(&self, record: &StoreRecord) -> SyncResult<()>;
}

fn store_error(err: DbError) -> SyncError {
    if err.is_transient() {
        SyncError::StoreUnavailable(err.to_string())
    } else {
        SyncError::StoreError(err.to_string())
    }
}

/// Opens the authoritative database file as-is: never created, never
/// migrated, and refused while its schema is behind this build.
pub(crate) async fn open_authoritative(path: &Path) -> SyncResult<Database> {
    let config = DbConfig::new(path)
        .max_connections(2)
        .run_migrations(false)
        .create_if_missing(false);

    let db = Database::new(config)
        .await
        .map_err(|e| SyncError::StoreUnavailable(e.to_string()))?;

    let (total, applied) = migrations::migration_status(db.pool())
        .await
        .map_err(store_error)?;
    if applied < total {
        db.close().await;
        return Err(SyncError::StoreUnavailable(format!(
            "{} schema at migration {} of {}",
            path.display(),
            applied,
            total
        )));
    }

    Ok(db)
}

// =============================================================================
// Local SQLite Store
// =============================================================================

/// Store backed by a database this process already has open.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    records: RecordRepository,
}

impl SqliteRecordStore {
    pub fn new(db: &Database) -> Self {
        SqliteRecordStore {
            records: db.records(),
        }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn modified_since(
        &self,
        table: &str,
        marker: &SyncMarker,
        limit: u32,
    ) -> SyncResult<Vec<StoreRecord>> {
        self.records
            .modified_since(table, marker, limit)
            .await
            .map_err(store_error)
    }

    async fn get(&self, table: &str, record_id: &str) -> SyncResult<Option<StoreRecord>> {
        self.records.get(table, record_id).await.map_err(store_error)
    }

    async fn upsert(&self, record: &StoreRecord) -> SyncResult<()> {
        self.records.upsert(record).await.map_err(store_error)
    }
}

// =============================================================================
// Shared Data Path Store
// =============================================================================

/// The authoritative database file on a shared folder.
///
/// ## Connection Lifecycle
/// ```text
/// ┌──────────┐  first use   ┌──────────┐  transient error  ┌──────────┐
/// │  Closed  │ ───────────► │   Open   │ ────────────────► │ Backoff  │
/// └──────────┘              └──────────┘                   └────┬─────┘
///       ▲                                                       │
///       └──────────────────── delay elapsed ────────────────────┘
/// ```
/// The file is never created: a missing file means the share is not mounted.
pub struct SharedPathStore {
    path: PathBuf,
    connection: Mutex<Connection>,
}

struct Connection {
    db: Option<Database>,
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
}

impl Connection {
    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_backoff().unwrap_or(Duration::from_secs(60));
        debug!(?delay, "Shared store reconnect scheduled");
        self.retry_at = Some(Instant::now() + delay);
    }
}

impl SharedPathStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_backoff(path, Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn with_backoff(path: impl Into<PathBuf>, initial: Duration, max: Duration) -> Self {
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            max_interval: max,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        SharedPathStore {
            path: path.into(),
            connection: Mutex::new(Connection {
                db: None,
                backoff,
                retry_at: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.db.is_some()
    }

    async fn records(&self) -> SyncResult<RecordRepository> {
        let mut conn = self.connection.lock().await;

        if let Some(ref db) = conn.db {
            return Ok(db.records());
        }

        if let Some(at) = conn.retry_at {
            if Instant::now() < at {
                return Err(SyncError::StoreUnavailable(format!(
                    "{} unavailable, waiting to reconnect",
                    self.path.display()
                )));
            }
        }

        if let Err(e) = tokio::fs::metadata(&self.path).await {
            conn.schedule_retry();
            return Err(SyncError::StoreUnavailable(format!(
                "{}: {}",
                self.path.display(),
                e
            )));
        }

        match open_authoritative(&self.path).await {
            Ok(db) => {
                info!(path = %self.path.display(), "Opened authoritative database");
                conn.backoff.reset();
                conn.retry_at = None;
                let records = db.records();
                conn.db = Some(db);
                Ok(records)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot open authoritative database");
                conn.schedule_retry();
                Err(e)
            }
        }
    }

    /// Maps a repository error, dropping the connection if it looks dead.
    async fn fail(&self, err: DbError) -> SyncError {
        if err.is_transient() {
            let mut conn = self.connection.lock().await;
            if let Some(db) = conn.db.take() {
                warn!(path = %self.path.display(), error = %err, "Lost authoritative database");
                db.close().await;
            }
            conn.schedule_retry();
        }
        store_error(err)
    }
}

#[async_trait]
impl RecordStore for SharedPathStore {
    async fn modified_since(
        &self,
        table: &str,
        marker: &SyncMarker,
        limit: u32,
    ) -> SyncResult<Vec<StoreRecord>> {
        let records = self.records().await?;
        match records.modified_since(table, marker, limit).await {
            Ok(found) => Ok(found),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn get(&self, table: &str, record_id: &str) -> SyncResult<Option<StoreRecord>> {
        let records = self.records().await?;
        match records.get(table, record_id).await {
            Ok(found) => Ok(found),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn upsert(&self, record: &StoreRecord) -> SyncResult<()> {
        let records = self.records().await?;
        match records.upsert(record).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, record_at};

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let db = memory_db().await;
        let store = SqliteRecordStore::new(&db);

        let record = record_at("customers", "c-1", "TERM-A", 100, "Ada");
        store.upsert(&record).await.unwrap();

        assert_eq!(store.get("customers", "c-1").await.unwrap(), Some(record.clone()));
        let since = store
            .modified_since("customers", &SyncMarker::origin(), 10)
            .await
            .unwrap();
        assert_eq!(since, vec![record.clone()]);
        assert!(store
            .modified_since("customers", &record.marker(), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_shared_store_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.db");
        let store = SharedPathStore::with_backoff(&path, Duration::ZERO, Duration::ZERO);

        let err = store.get("customers", "c-1").await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
        assert!(!path.exists());
        assert!(!store.is_connected().await);
    }

    #[tokio::test]
    async fn test_shared_store_connects_once_share_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.db");
        let store = SharedPathStore::with_backoff(&path, Duration::ZERO, Duration::ZERO);

        assert!(store.get("customers", "c-1").await.is_err());

        // The authoritative terminal creates its database
        let authoritative = Database::new(DbConfig::new(&path)).await.unwrap();
        let record = record_at("customers", "c-1", "TERM-A", 100, "Ada");
        authoritative.records().upsert(&record).await.unwrap();

        assert_eq!(store.get("customers", "c-1").await.unwrap(), Some(record));
        assert!(store.is_connected().await);

        let update = record_at("customers", "c-1", "TERM-B", 200, "Ada L.");
        store.upsert(&update).await.unwrap();
        assert_eq!(
            authoritative.records().get("customers", "c-1").await.unwrap(),
            Some(update)
        );
    }

    #[tokio::test]
    async fn test_shared_store_waits_out_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.db");
        let store =
            SharedPathStore::with_backoff(&path, Duration::from_secs(300), Duration::from_secs(300));

        assert!(store.get("customers", "c-1").await.is_err());
        Database::new(DbConfig::new(&path)).await.unwrap();

        // Still inside the reconnect delay
        let err = store.get("customers", "c-1").await.unwrap_err();
        assert!(err.to_string().contains("waiting to reconnect"));
    }

    #[tokio::test]
    async fn test_shared_store_refuses_outdated_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.db");
        let stale = Database::new(DbConfig::new(&path).run_migrations(false))
            .await
            .unwrap();

        let store = SharedPathStore::with_backoff(&path, Duration::ZERO, Duration::ZERO);
        let err = store.get("customers", "c-1").await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(ref m) if m.contains("schema")));
        assert!(!store.is_connected().await);

        migrations::run_migrations(stale.pool()).await.unwrap();
        assert_eq!(store.get("customers", "c-1").await.unwrap(), None);
        assert!(store.is_connected().await);
    }
}
