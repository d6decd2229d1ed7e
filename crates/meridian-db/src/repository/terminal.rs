//! # Terminal Repository
//!
//! Rows of the terminal registry. Decommissioned terminals are soft-deleted
//! (`decommissioned_ms` set) and drop out of every "active" query; the
//! partial unique indexes only cover active rows, so a replaced machine can
//! re-register with the same fingerprint.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::{from_millis, opt_from_millis, to_millis};
use crate::error::DbResult;
use meridian_core::{SyncStatus, Terminal, TerminalRegistration, TerminalRole, TerminalStatus};

const SELECT_TERMINAL: &str = r#"
    SELECT terminal_id, display_name, role, address, hardware_fingerprint, app_version,
           status, last_seen_ms, last_heartbeat_ms, pending_journal_count, last_sync_ms,
           sync_status, decommissioned_ms, created_ms, updated_ms
    FROM terminals
"#;

#[derive(Debug, sqlx::FromRow)]
struct TerminalRow {
    terminal_id: String,
    display_name: String,
    role: TerminalRole,
    address: Option<String>,
    hardware_fingerprint: String,
    app_version: Option<String>,
    status: TerminalStatus,
    last_seen_ms: Option<i64>,
    last_heartbeat_ms: Option<i64>,
    pending_journal_count: i64,
    last_sync_ms: Option<i64>,
    sync_status: SyncStatus,
    decommissioned_ms: Option<i64>,
    created_ms: i64,
    updated_ms: i64,
}

impl TerminalRow {
    fn into_terminal(self) -> DbResult<Terminal> {
        const ENTITY: &str = "terminal";
        let id = self.terminal_id.as_str();
        Ok(Terminal {
            last_seen_at: opt_from_millis(ENTITY, id, self.last_seen_ms)?,
            last_heartbeat_at: opt_from_millis(ENTITY, id, self.last_heartbeat_ms)?,
            last_sync_at: opt_from_millis(ENTITY, id, self.last_sync_ms)?,
            decommissioned_at: opt_from_millis(ENTITY, id, self.decommissioned_ms)?,
            created_at: from_millis(ENTITY, id, self.created_ms)?,
            updated_at: from_millis(ENTITY, id, self.updated_ms)?,
            terminal_id: self.terminal_id,
            display_name: self.display_name,
            role: self.role,
            address: self.address,
            hardware_fingerprint: self.hardware_fingerprint,
            app_version: self.app_version,
            status: self.status,
            pending_journal_count: self.pending_journal_count,
            sync_status: self.sync_status,
        })
    }
}

/// Repository for terminal registry rows.
#[derive(Debug, Clone)]
pub struct TerminalRepository {
    pool: SqlitePool,
}

impl TerminalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        TerminalRepository { pool }
    }

    /// Inserts a new terminal.
    ///
    /// ## Errors
    /// `UniqueViolation` when the id, the active fingerprint or the single
    /// active authoritative slot is already taken.
    pub async fn insert(&self, terminal: &Terminal) -> DbResult<()> {
        debug!(terminal_id = %terminal.terminal_id, role = %terminal.role, "Inserting terminal");

        sqlx::query(
            r#"
            INSERT INTO terminals (
                terminal_id, display_name, role, address, hardware_fingerprint, app_version,
                status, last_seen_ms, last_heartbeat_ms, pending_journal_count, last_sync_ms,
                sync_status, decommissioned_ms, created_ms, updated_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&terminal.terminal_id)
        .bind(&terminal.display_name)
        .bind(terminal.role)
        .bind(&terminal.address)
        .bind(&terminal.hardware_fingerprint)
        .bind(&terminal.app_version)
        .bind(terminal.status)
        .bind(terminal.last_seen_at.map(to_millis))
        .bind(terminal.last_heartbeat_at.map(to_millis))
        .bind(terminal.pending_journal_count)
        .bind(terminal.last_sync_at.map(to_millis))
        .bind(terminal.sync_status)
        .bind(terminal.decommissioned_at.map(to_millis))
        .bind(to_millis(terminal.created_at))
        .bind(to_millis(terminal.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Refreshes the self-reported fields of an active terminal.
    pub async fn update_registration(
        &self,
        terminal_id: &str,
        registration: &TerminalRegistration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminals SET
                display_name = ?2,
                role = ?3,
                address = ?4,
                app_version = ?5,
                updated_ms = ?6
            WHERE terminal_id = ?1 AND decommissioned_ms IS NULL
            "#,
        )
        .bind(terminal_id)
        .bind(registration.display_name.trim())
        .bind(registration.role)
        .bind(&registration.address)
        .bind(&registration.app_version)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Gets a terminal by id, decommissioned or not.
    pub async fn get(&self, terminal_id: &str) -> DbResult<Option<Terminal>> {
        let row: Option<TerminalRow> =
            sqlx::query_as(&format!("{} WHERE terminal_id = ?1", SELECT_TERMINAL))
                .bind(terminal_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TerminalRow::into_terminal).transpose()
    }

    pub async fn find_active_by_fingerprint(&self, fingerprint: &str) -> DbResult<Option<Terminal>> {
        let row: Option<TerminalRow> = sqlx::query_as(&format!(
            "{} WHERE hardware_fingerprint = ?1 AND decommissioned_ms IS NULL",
            SELECT_TERMINAL
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TerminalRow::into_terminal).transpose()
    }

    /// The active authoritative terminal, if one is registered.
    pub async fn find_authoritative(&self) -> DbResult<Option<Terminal>> {
        let row: Option<TerminalRow> = sqlx::query_as(&format!(
            "{} WHERE role = 'authoritative' AND decommissioned_ms IS NULL",
            SELECT_TERMINAL
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(TerminalRow::into_terminal).transpose()
    }

    /// All active terminals, authoritative first, then by name.
    pub async fn list_active(&self) -> DbResult<Vec<Terminal>> {
        let rows: Vec<TerminalRow> = sqlx::query_as(&format!(
            "{} WHERE decommissioned_ms IS NULL ORDER BY role = 'satellite', display_name, terminal_id",
            SELECT_TERMINAL
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TerminalRow::into_terminal).collect()
    }

    /// Records a heartbeat and sets the reported status.
    pub async fn heartbeat(
        &self,
        terminal_id: &str,
        status: TerminalStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminals SET
                status = ?2,
                last_heartbeat_ms = ?3,
                last_seen_ms = ?3,
                updated_ms = ?3
            WHERE terminal_id = ?1 AND decommissioned_ms IS NULL
            "#,
        )
        .bind(terminal_id)
        .bind(status)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_offline(&self, terminal_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminals SET status = 'offline', updated_ms = ?2
            WHERE terminal_id = ?1 AND decommissioned_ms IS NULL
            "#,
        )
        .bind(terminal_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Stores the outcome of a sync cycle. `last_sync_ms` only moves on a
    /// successful sync.
    pub async fn record_sync(
        &self,
        terminal_id: &str,
        sync_status: SyncStatus,
        pending_journal_count: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminals SET
                sync_status = ?2,
                pending_journal_count = ?3,
                last_sync_ms = CASE WHEN ?2 = 'synced' THEN ?4 ELSE last_sync_ms END,
                last_seen_ms = ?4,
                updated_ms = ?4
            WHERE terminal_id = ?1 AND decommissioned_ms IS NULL
            "#,
        )
        .bind(terminal_id)
        .bind(sync_status)
        .bind(pending_journal_count)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-deletes a terminal.
    pub async fn decommission(&self, terminal_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminals SET
                status = 'offline',
                decommissioned_ms = ?2,
                updated_ms = ?2
            WHERE terminal_id = ?1 AND decommissioned_ms IS NULL
            "#,
        )
        .bind(terminal_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks every active terminal whose last heartbeat is older than
    /// `cutoff` as offline, except `keep`. Returns the ids that changed.
    pub async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
        keep: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE terminals SET status = 'offline', updated_ms = ?3
            WHERE decommissioned_ms IS NULL
              AND status != 'offline'
              AND terminal_id != ?2
              AND (last_heartbeat_ms IS NULL OR last_heartbeat_ms < ?1)
            RETURNING terminal_id
            "#,
        )
        .bind(to_millis(cutoff))
        .bind(keep)
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::{Database, DbConfig};
    use chrono::Duration;

    fn terminal(id: &str, fingerprint: &str, role: TerminalRole) -> Terminal {
        let now = meridian_core::storage_precision(Utc::now());
        Terminal {
            terminal_id: id.into(),
            display_name: format!("Register {}", id),
            role,
            address: Some("10.0.0.5:5000".into()),
            hardware_fingerprint: fingerprint.into(),
            app_version: Some("1.0.0".into()),
            status: TerminalStatus::Online,
            last_seen_at: Some(now),
            last_heartbeat_at: Some(now),
            pending_journal_count: 0,
            last_sync_at: None,
            sync_status: SyncStatus::Pending,
            decommissioned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn repo() -> TerminalRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().terminals()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = repo().await;
        let t = terminal("TERM-A", "fp-a", TerminalRole::Authoritative);
        repo.insert(&t).await.unwrap();

        assert_eq!(repo.get("TERM-A").await.unwrap(), Some(t.clone()));
        assert_eq!(repo.find_active_by_fingerprint("fp-a").await.unwrap(), Some(t.clone()));
        assert_eq!(repo.find_authoritative().await.unwrap(), Some(t));
        assert!(repo.get("TERM-Z").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_authoritative_enforced_by_schema() {
        let repo = repo().await;
        repo.insert(&terminal("TERM-A", "fp-a", TerminalRole::Authoritative))
            .await
            .unwrap();

        let err = repo
            .insert(&terminal("TERM-B", "fp-b", TerminalRole::Authoritative))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_decommission_frees_fingerprint() {
        let repo = repo().await;
        repo.insert(&terminal("TERM-A", "fp-a", TerminalRole::Satellite))
            .await
            .unwrap();

        assert!(repo.decommission("TERM-A", Utc::now()).await.unwrap());
        assert!(!repo.decommission("TERM-A", Utc::now()).await.unwrap());
        assert!(repo.find_active_by_fingerprint("fp-a").await.unwrap().is_none());
        assert!(repo.list_active().await.unwrap().is_empty());

        // Same hardware can come back under a new id
        repo.insert(&terminal("TERM-B", "fp-a", TerminalRole::Satellite))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_record_sync_only_stamps_success() {
        let repo = repo().await;
        repo.insert(&terminal("TERM-A", "fp-a", TerminalRole::Satellite))
            .await
            .unwrap();

        repo.record_sync("TERM-A", SyncStatus::Failed, 4, Utc::now())
            .await
            .unwrap();
        let t = repo.get("TERM-A").await.unwrap().unwrap();
        assert_eq!(t.sync_status, SyncStatus::Failed);
        assert_eq!(t.pending_journal_count, 4);
        assert!(t.last_sync_at.is_none());

        repo.record_sync("TERM-A", SyncStatus::Synced, 0, Utc::now())
            .await
            .unwrap();
        let t = repo.get("TERM-A").await.unwrap().unwrap();
        assert_eq!(t.sync_status, SyncStatus::Synced);
        assert!(t.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_stale_offline() {
        let repo = repo().await;
        let now = Utc::now();
        let mut stale = terminal("TERM-B", "fp-b", TerminalRole::Satellite);
        stale.last_heartbeat_at = Some(now - Duration::minutes(10));
        repo.insert(&terminal("TERM-A", "fp-a", TerminalRole::Authoritative))
            .await
            .unwrap();
        repo.insert(&stale).await.unwrap();
        repo.insert(&terminal("TERM-C", "fp-c", TerminalRole::Satellite))
            .await
            .unwrap();

        let changed = repo
            .mark_stale_offline(now - Duration::seconds(90), "TERM-A", now)
            .await
            .unwrap();
        assert_eq!(changed, vec!["TERM-B".to_string()]);

        let b = repo.get("TERM-B").await.unwrap().unwrap();
        assert_eq!(b.status, TerminalStatus::Offline);
    }
}
