//! # Database Pool Management
//!
//! Connection pool creation and configuration for SQLite.
//!
//! ## Durability
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  journal_mode = WAL     Readers don't block the journal writer         │
//! │  synchronous  = FULL    fsync on every commit: an acknowledged         │
//! │                         enqueue survives a power cut                    │
//! │  foreign_keys = ON                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same type opens both the terminal's own database and, on satellite
//! terminals, the authoritative terminal's database on the shared data path.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::{
    ConflictRepository, DeferredJobRepository, JournalRepository, PowerEventRepository,
    RecordRepository, SyncCheckpointRepository, TerminalRepository,
    TransactionCheckpointRepository,
};

const IN_MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/meridian/terminal.db")
///     .max_connections(4)
///     .durable_writes(true);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Default: 5
    pub max_connections: u32,

    /// Default: 1
    pub min_connections: u32,

    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection. `None` keeps connections
    /// open, which in-memory databases require.
    pub idle_timeout: Option<Duration>,

    /// FULL synchronous when true, NORMAL otherwise.
    /// Default: true
    pub durable_writes: bool,

    /// Default: true
    pub run_migrations: bool,

    /// False for databases owned by another terminal: a missing file means
    /// the share is not mounted, not that a fresh database is wanted.
    /// Default: true
    pub create_if_missing: bool,
}

impl DbConfig {
    /// Creates a configuration for the database file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            durable_writes: true,
            run_migrations: true,
            create_if_missing: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn durable_writes(mut self, durable: bool) -> Self {
        self.durable_writes = durable;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// A single connection that never idles out: every connection to
    /// `:memory:` is its own database.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: None,
            durable_writes: false,
            run_migrations: true,
            create_if_missing: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle providing repository access.
///
/// Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures WAL, synchronous mode and foreign keys
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        let connect_options = if config.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(config.create_if_missing)
                .journal_mode(SqliteJournalMode::Wal)
        };

        let synchronous = if config.durable_writes {
            SqliteSynchronous::Full
        } else {
            SqliteSynchronous::Normal
        };

        let connect_options = connect_options
            .synchronous(synchronous)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        debug!(?synchronous, "Connection options configured");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout);

        if config.is_in_memory() {
            pool_options = pool_options.max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let db = Database { pool };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Returns a reference to the connection pool.
    ///
    /// Prefer using repository methods when available.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn terminals(&self) -> TerminalRepository {
        TerminalRepository::new(self.pool.clone())
    }

    pub fn journal(&self) -> JournalRepository {
        JournalRepository::new(self.pool.clone())
    }

    pub fn sync_checkpoints(&self) -> SyncCheckpointRepository {
        SyncCheckpointRepository::new(self.pool.clone())
    }

    pub fn conflicts(&self) -> ConflictRepository {
        ConflictRepository::new(self.pool.clone())
    }

    pub fn power_events(&self) -> PowerEventRepository {
        PowerEventRepository::new(self.pool.clone())
    }

    pub fn transaction_checkpoints(&self) -> TransactionCheckpointRepository {
        TransactionCheckpointRepository::new(self.pool.clone())
    }

    pub fn deferred_jobs(&self) -> DeferredJobRepository {
        DeferredJobRepository::new(self.pool.clone())
    }

    /// Replicated rows of the synchronized tables.
    pub fn records(&self) -> RecordRepository {
        RecordRepository::new(self.pool.clone())
    }

    /// Closes the pool. All repository operations fail afterwards.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database can execute queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
