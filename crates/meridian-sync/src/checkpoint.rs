//! Transaction checkpoints for sessions interrupted by a power cut.
//!
//! After a restart the supervisor calls [`TransactionCheckpoints::begin_recovery`].
//! Every session it returns is locked until the operator resumes or
//! discards it through [`TransactionCheckpoints::mark_recovered`].

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use meridian_core::{TransactionCheckpoint, TransactionSnapshot};
use meridian_db::{Database, TransactionCheckpointRepository};

use crate::error::{SyncError, SyncResult};
use crate::notify::{Notification, Notifier};
use crate::safe_mode::AdmissionGate;

#[derive(Clone)]
pub struct TransactionCheckpoints {
    terminal_id: String,
    repo: TransactionCheckpointRepository,
    gate: AdmissionGate,
    retention: chrono::Duration,
    /// Sessions found at startup and not yet resumed or discarded.
    awaiting: Arc<RwLock<HashSet<String>>>,
    notifier: Arc<dyn Notifier>,
}

impl TransactionCheckpoints {
    pub fn new(
        terminal_id: impl Into<String>,
        db: &Database,
        gate: AdmissionGate,
        retention: chrono::Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        TransactionCheckpoints {
            terminal_id: terminal_id.into(),
            repo: db.transaction_checkpoints(),
            gate,
            retention,
            awaiting: Arc::new(RwLock::new(HashSet::new())),
            notifier,
        }
    }

    /// Auto-saves a session. Returns the new save count.
    ///
    /// ## Errors
    /// - `RecoveryRequired` while the session awaits a recovery decision
    /// - `SafeModeActive` for a new session during safe mode
    /// - `SessionClosed` once the session was completed or discarded
    /// - `CheckpointWriteFailure` when storage fails
    pub async fn save(
        &self,
        session_id: &str,
        snapshot: &TransactionSnapshot,
        last_action: &str,
    ) -> SyncResult<i64> {
        if self.awaiting.read().await.contains(session_id) {
            return Err(SyncError::RecoveryRequired {
                session_id: session_id.to_string(),
            });
        }

        if self.gate.is_safe_mode_active() {
            let existing = self
                .repo
                .get(&self.terminal_id, session_id)
                .await
                .map_err(|e| self.write_failure(session_id, e))?;
            if existing.is_none() {
                return Err(SyncError::SafeModeActive);
            }
        }

        let now = Utc::now();
        let saved = self
            .repo
            .save(
                &self.terminal_id,
                session_id,
                snapshot,
                last_action,
                now,
                now + self.retention,
            )
            .await
            .map_err(|e| self.write_failure(session_id, e))?;

        match saved {
            Some(count) => {
                debug!(session_id, last_action, count, "Checkpoint saved");
                Ok(count)
            }
            None => Err(SyncError::SessionClosed(session_id.to_string())),
        }
    }

    fn write_failure(&self, session_id: &str, err: meridian_db::DbError) -> SyncError {
        error!(terminal_id = %self.terminal_id, session_id, error = %err, "Checkpoint write failed");
        SyncError::CheckpointWriteFailure {
            session_id: session_id.to_string(),
            reason: err.to_string(),
        }
    }

    pub async fn get(&self, session_id: &str) -> SyncResult<Option<TransactionCheckpoint>> {
        Ok(self.repo.get(&self.terminal_id, session_id).await?)
    }

    /// Active checkpoints nobody has tried to recover yet.
    pub async fn list_pending(&self) -> SyncResult<Vec<TransactionCheckpoint>> {
        Ok(self.repo.list_pending(&self.terminal_id).await?)
    }

    /// Locks every pending session until a recovery decision is made.
    pub async fn begin_recovery(&self) -> SyncResult<Vec<TransactionCheckpoint>> {
        let pending = self.list_pending().await?;

        {
            let mut awaiting = self.awaiting.write().await;
            awaiting.extend(pending.iter().map(|c| c.session_id.clone()));
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "Interrupted transactions found");
            self.notifier.notify(&Notification::RecoveryPending {
                count: pending.len(),
            });
        }
        Ok(pending)
    }

    pub async fn awaiting_recovery(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.awaiting.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Resume (`successful = true`) or discard a session.
    pub async fn mark_recovered(
        &self,
        session_id: &str,
        successful: bool,
        notes: Option<&str>,
    ) -> SyncResult<bool> {
        let updated = self
            .repo
            .mark_recovered(&self.terminal_id, session_id, successful, notes, Utc::now())
            .await?;

        self.awaiting.write().await.remove(session_id);

        if updated {
            info!(session_id, successful, "Checkpoint recovery recorded");
        }
        Ok(updated)
    }

    pub async fn complete(&self, session_id: &str) -> SyncResult<bool> {
        let completed = self
            .repo
            .complete(&self.terminal_id, session_id, Utc::now())
            .await?;
        self.awaiting.write().await.remove(session_id);
        Ok(completed)
    }

    pub async fn count_active(&self) -> SyncResult<i64> {
        Ok(self.repo.count_active(&self.terminal_id).await?)
    }

    /// Purges finished checkpoints older than the retention period.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let purged = self.repo.purge_closed(now - self.retention).await?;
        if purged > 0 {
            info!(purged, "Swept finished checkpoints");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_mode::{SafeModeController, TracingSink};
    use crate::testing::{memory_db, RecordingNotifier};
    use meridian_core::{CheckpointState, PowerState};
    use meridian_core::journal::SaleLine;

    fn sale(step: &str) -> TransactionSnapshot {
        TransactionSnapshot::Sale {
            lines: vec![SaleLine {
                product_id: "p-1".into(),
                quantity: 2,
                unit_price_cents: 350,
            }],
            customer_id: None,
            tendered_cents: 0,
            step: step.into(),
        }
    }

    struct Fixture {
        db: Database,
        safe_mode: SafeModeController,
        notifier: Arc<RecordingNotifier>,
        checkpoints: TransactionCheckpoints,
    }

    async fn fixture() -> Fixture {
        let db = memory_db().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let safe_mode =
            SafeModeController::new("TERM-A", &db, Arc::new(TracingSink), notifier.clone());
        let checkpoints = TransactionCheckpoints::new(
            "TERM-A",
            &db,
            safe_mode.gate(),
            chrono::Duration::hours(48),
            notifier.clone(),
        );
        Fixture {
            db,
            safe_mode,
            notifier,
            checkpoints,
        }
    }

    #[tokio::test]
    async fn test_save_increments_auto_save_count() {
        let f = fixture().await;
        assert_eq!(f.checkpoints.save("s-1", &sale("scanning"), "scan").await.unwrap(), 1);
        assert_eq!(f.checkpoints.save("s-1", &sale("payment"), "tender").await.unwrap(), 2);

        let saved = f.checkpoints.get("s-1").await.unwrap().unwrap();
        assert_eq!(saved.last_action, "tender");
        assert_eq!(saved.snapshot, sale("payment"));
        assert_eq!(saved.state, CheckpointState::Active);
    }

    #[tokio::test]
    async fn test_safe_mode_refuses_only_new_sessions() {
        let f = fixture().await;
        f.checkpoints.save("s-1", &sale("scanning"), "scan").await.unwrap();
        f.safe_mode.on_power_state(PowerState::Critical).await.unwrap();

        // In-flight sale keeps checkpointing
        assert_eq!(f.checkpoints.save("s-1", &sale("payment"), "tender").await.unwrap(), 2);
        assert!(matches!(
            f.checkpoints.save("s-2", &sale("scanning"), "scan").await,
            Err(SyncError::SafeModeActive)
        ));
        assert!(f.checkpoints.get("s-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recovery_gates_interrupted_sessions() {
        let f = fixture().await;
        f.checkpoints.save("s-1", &sale("payment"), "tender").await.unwrap();
        f.checkpoints.save("s-2", &sale("scanning"), "scan").await.unwrap();

        // Restart: a fresh service over the same database
        let restarted = TransactionCheckpoints::new(
            "TERM-A",
            &f.db,
            f.safe_mode.gate(),
            chrono::Duration::hours(48),
            f.notifier.clone(),
        );
        let pending = restarted.begin_recovery().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(f
            .notifier
            .events()
            .contains(&Notification::RecoveryPending { count: 2 }));
        assert_eq!(restarted.awaiting_recovery().await, vec!["s-1", "s-2"]);

        assert!(matches!(
            restarted.save("s-1", &sale("payment"), "tender").await,
            Err(SyncError::RecoveryRequired { .. })
        ));

        // Resume s-1, discard s-2
        assert!(restarted.mark_recovered("s-1", true, Some("resumed")).await.unwrap());
        assert!(restarted.mark_recovered("s-2", false, None).await.unwrap());
        assert!(restarted.awaiting_recovery().await.is_empty());

        assert_eq!(restarted.save("s-1", &sale("paid"), "tender").await.unwrap(), 2);
        assert!(matches!(
            restarted.save("s-2", &sale("scanning"), "scan").await,
            Err(SyncError::SessionClosed(_))
        ));

        // s-1 was already offered once
        assert!(restarted.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_checkpoints() {
        let f = fixture().await;
        f.checkpoints.save("s-open", &sale("scanning"), "scan").await.unwrap();
        f.checkpoints.save("s-done", &sale("paid"), "tender").await.unwrap();
        assert!(f.checkpoints.complete("s-done").await.unwrap());

        // Nothing is old enough yet
        assert_eq!(f.checkpoints.sweep(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::hours(49);
        assert_eq!(f.checkpoints.sweep(later).await.unwrap(), 1);
        assert!(f.checkpoints.get("s-done").await.unwrap().is_none());
        assert!(f.checkpoints.get("s-open").await.unwrap().is_some());
        assert_eq!(f.checkpoints.count_active().await.unwrap(), 1);
    }
}
