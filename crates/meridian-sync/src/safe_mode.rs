//! # Safe Mode Controller
//!
//! Stops new work from starting while the terminal is about to lose power.
//!
//! ## States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   NORMAL ──── low_battery / critical ────► SAFE MODE                    │
//! │     ▲                                         │                         │
//! │     │                                         │ on_battery,             │
//! │     │                                         │ not_detected: stay      │
//! │     └──── online: flush deferred jobs ◄───────┘                         │
//! │                                                                         │
//! │   NORMAL: any reading retries jobs still pending from an earlier run    │
//! │                                                                         │
//! │   SAFE MODE                                                             │
//! │   • admit_new_transaction() → SafeModeActive                            │
//! │   • in-flight sessions keep checkpointing                               │
//! │   • receipts / print jobs / drawer kicks parked in deferred_jobs        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The flag lives in a `watch` channel. Only the controller holds the
//! sender; request handlers get a cloneable [`AdmissionGate`].

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use meridian_core::hardware::MAX_DISPATCH_ATTEMPTS;
use meridian_core::{DeferredJobStatus, HardwareJob, PowerState};
use meridian_db::{Database, DeferredJobRepository};

use crate::error::{SyncError, SyncResult};
use crate::notify::{Notification, Notifier};

const FLUSH_BATCH: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeModeState {
    Normal,
    SafeMode,
}

// =============================================================================
// Admission Gate
// =============================================================================

/// Read-only view of the safe mode flag for the request layer.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    state: watch::Receiver<SafeModeState>,
}

impl AdmissionGate {
    pub fn is_safe_mode_active(&self) -> bool {
        *self.state.borrow() == SafeModeState::SafeMode
    }

    /// Call before starting a new transaction.
    pub fn admit_new_transaction(&self) -> SyncResult<()> {
        if self.is_safe_mode_active() {
            Err(SyncError::SafeModeActive)
        } else {
            Ok(())
        }
    }

    pub fn may_start_hardware_io(&self) -> bool {
        !self.is_safe_mode_active()
    }

    /// Waits for the next safe mode change.
    pub async fn changed(&mut self) -> SyncResult<SafeModeState> {
        self.state
            .changed()
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        Ok(*self.state.borrow())
    }
}

// =============================================================================
// Hardware Sink
// =============================================================================

/// Where hardware work goes once it may run.
#[async_trait]
pub trait HardwareSink: Send + Sync {
    async fn dispatch(&self, job: &HardwareJob) -> SyncResult<()>;
}

/// Logs jobs instead of driving real devices.
pub struct TracingSink;

#[async_trait]
impl HardwareSink for TracingSink {
    async fn dispatch(&self, job: &HardwareJob) -> SyncResult<()> {
        info!(job_id = %job.job_id, kind = ?job.kind, session_id = ?job.session_id, "Hardware job dispatched");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Dispatched,
    /// Parked until safe mode ends.
    Deferred,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
    pub abandoned: usize,
}

// =============================================================================
// Controller
// =============================================================================

pub struct SafeModeController {
    terminal_id: String,
    state: watch::Sender<SafeModeState>,
    /// Serializes transitions and flushes.
    transition: Mutex<()>,
    jobs: DeferredJobRepository,
    sink: Arc<dyn HardwareSink>,
    notifier: Arc<dyn Notifier>,
}

impl SafeModeController {
    pub fn new(
        terminal_id: impl Into<String>,
        db: &Database,
        sink: Arc<dyn HardwareSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(SafeModeState::Normal);
        SafeModeController {
            terminal_id: terminal_id.into(),
            state,
            transition: Mutex::new(()),
            jobs: db.deferred_jobs(),
            sink,
            notifier,
        }
    }

    pub fn gate(&self) -> AdmissionGate {
        AdmissionGate {
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> SafeModeState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SafeModeState::SafeMode
    }

    /// Applies a power classification. Returns the new state when it changed.
    pub async fn on_power_state(&self, power: PowerState) -> SyncResult<Option<SafeModeState>> {
        let _guard = self.transition.lock().await;

        match (self.state(), power) {
            (SafeModeState::Normal, p) if p.requires_safe_mode() => {
                self.state.send_replace(SafeModeState::SafeMode);
                warn!(terminal_id = %self.terminal_id, power_state = %p, "Entering safe mode");
                self.notifier
                    .notify(&Notification::SafeModeEntered { power_state: p });
                Ok(Some(SafeModeState::SafeMode))
            }
            (SafeModeState::SafeMode, PowerState::Online) => {
                let mut attempted = HashSet::new();
                let mut report = self.flush_locked(&mut attempted).await?;
                self.state.send_replace(SafeModeState::Normal);

                // Jobs deferred while the first flush was running
                let late = self.flush_locked(&mut attempted).await?;
                report.flushed += late.flushed;
                report.failed += late.failed;
                report.abandoned += late.abandoned;

                info!(
                    terminal_id = %self.terminal_id,
                    flushed = report.flushed,
                    failed = report.failed,
                    abandoned = report.abandoned,
                    "Leaving safe mode"
                );
                self.notifier.notify(&Notification::SafeModeExited {
                    flushed_jobs: report.flushed,
                });
                Ok(Some(SafeModeState::Normal))
            }
            (SafeModeState::Normal, p) => {
                // Jobs parked before a restart, or whose dispatch failed on the way out
                let report = self.flush_locked(&mut HashSet::new()).await?;
                if report != FlushReport::default() {
                    info!(
                        terminal_id = %self.terminal_id,
                        power_state = %p,
                        flushed = report.flushed,
                        failed = report.failed,
                        abandoned = report.abandoned,
                        "Flushed leftover deferred jobs"
                    );
                }
                Ok(None)
            }
            (SafeModeState::SafeMode, p) => {
                debug!(power_state = %p, "Safe mode unchanged");
                Ok(None)
            }
        }
    }

    /// Dispatches now, or parks the job while safe mode is active.
    pub async fn submit_hardware_job(&self, job: HardwareJob) -> SyncResult<SubmitOutcome> {
        if self.is_active() {
            self.jobs.defer(&self.terminal_id, &job, Utc::now()).await?;
            debug!(job_id = %job.job_id, kind = ?job.kind, "Hardware job deferred");
            return Ok(SubmitOutcome::Deferred);
        }

        self.sink.dispatch(&job).await?;
        Ok(SubmitOutcome::Dispatched)
    }

    /// Retries pending deferred jobs outside a transition (e.g. ones whose
    /// dispatch failed during the last exit).
    pub async fn flush_deferred(&self) -> SyncResult<FlushReport> {
        let _guard = self.transition.lock().await;
        if self.is_active() {
            return Ok(FlushReport::default());
        }
        self.flush_locked(&mut HashSet::new()).await
    }

    pub async fn pending_jobs(&self) -> SyncResult<i64> {
        Ok(self.jobs.count_pending(&self.terminal_id).await?)
    }

    /// Dispatches pending jobs once each; ids in `attempted` are skipped.
    async fn flush_locked(&self, attempted: &mut HashSet<String>) -> SyncResult<FlushReport> {
        let mut report = FlushReport::default();

        for deferred in self.jobs.pending(&self.terminal_id, FLUSH_BATCH).await? {
            let job = deferred.job;
            if !attempted.insert(job.job_id.clone()) {
                continue;
            }
            match self.sink.dispatch(&job).await {
                Ok(()) => {
                    if self.jobs.mark_flushed(&job.job_id, Utc::now()).await? {
                        report.flushed += 1;
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    let status = self
                        .jobs
                        .record_failure(&job.job_id, &reason, MAX_DISPATCH_ATTEMPTS)
                        .await?;
                    if status == Some(DeferredJobStatus::Abandoned) {
                        warn!(job_id = %job.job_id, %reason, "Deferred hardware job abandoned");
                        report.abandoned += 1;
                    } else {
                        warn!(job_id = %job.job_id, %reason, "Deferred hardware job failed");
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, RecordingNotifier, RecordingSink};
    use meridian_core::HardwareJobKind;
    use serde_json::json;

    fn receipt(n: u32) -> HardwareJob {
        HardwareJob::new(
            HardwareJobKind::Receipt,
            Some(format!("s-{}", n)),
            json!({ "receipt": n }),
        )
    }

    async fn controller() -> (Arc<RecordingSink>, Arc<RecordingNotifier>, SafeModeController) {
        let db = memory_db().await;
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = SafeModeController::new("TERM-A", &db, sink.clone(), notifier.clone());
        (sink, notifier, controller)
    }

    #[tokio::test]
    async fn test_low_battery_closes_the_gate() {
        let (_sink, notifier, controller) = controller().await;
        let gate = controller.gate();
        assert!(gate.admit_new_transaction().is_ok());

        // On battery above the threshold: keep selling
        assert_eq!(controller.on_power_state(PowerState::OnBattery).await.unwrap(), None);
        assert!(gate.may_start_hardware_io());

        assert_eq!(
            controller.on_power_state(PowerState::LowBattery).await.unwrap(),
            Some(SafeModeState::SafeMode)
        );
        assert!(gate.is_safe_mode_active());
        assert!(matches!(
            gate.admit_new_transaction(),
            Err(SyncError::SafeModeActive)
        ));
        assert!(!gate.may_start_hardware_io());

        // Repeated critical readings don't re-enter
        assert_eq!(controller.on_power_state(PowerState::Critical).await.unwrap(), None);
        // Losing the UPS doesn't end safe mode
        assert_eq!(controller.on_power_state(PowerState::NotDetected).await.unwrap(), None);
        assert!(gate.is_safe_mode_active());

        assert_eq!(notifier.count(|n| matches!(n, Notification::SafeModeEntered { .. })), 1);
    }

    #[tokio::test]
    async fn test_deferred_jobs_flush_exactly_once() {
        let (sink, notifier, controller) = controller().await;
        controller.on_power_state(PowerState::Critical).await.unwrap();

        let first = receipt(1);
        let second = receipt(2);
        assert_eq!(
            controller.submit_hardware_job(first.clone()).await.unwrap(),
            SubmitOutcome::Deferred
        );
        assert_eq!(
            controller.submit_hardware_job(second.clone()).await.unwrap(),
            SubmitOutcome::Deferred
        );
        assert!(sink.dispatched().is_empty());
        assert_eq!(controller.pending_jobs().await.unwrap(), 2);

        controller.on_power_state(PowerState::Online).await.unwrap();
        assert!(!controller.is_active());

        let ids: Vec<String> = sink.dispatched().into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![first.job_id.clone(), second.job_id.clone()]);
        assert_eq!(controller.pending_jobs().await.unwrap(), 0);

        // A second online reading and a manual flush dispatch nothing more
        controller.on_power_state(PowerState::Online).await.unwrap();
        controller.flush_deferred().await.unwrap();
        assert_eq!(sink.dispatched().len(), 2);

        assert!(notifier.events().contains(&Notification::SafeModeExited { flushed_jobs: 2 }));
    }

    #[tokio::test]
    async fn test_failing_job_is_abandoned_after_three_attempts() {
        let (sink, _notifier, controller) = controller().await;
        controller.on_power_state(PowerState::Critical).await.unwrap();
        controller.submit_hardware_job(receipt(1)).await.unwrap();

        sink.set_failing(true);
        controller.on_power_state(PowerState::Online).await.unwrap();
        assert_eq!(controller.pending_jobs().await.unwrap(), 1);

        assert_eq!(controller.flush_deferred().await.unwrap().failed, 1);
        let report = controller.flush_deferred().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(controller.pending_jobs().await.unwrap(), 0);

        sink.set_failing(false);
        assert_eq!(controller.flush_deferred().await.unwrap(), FlushReport::default());
    }

    #[tokio::test]
    async fn test_jobs_deferred_before_restart_flush_on_first_reading() {
        let db = memory_db().await;
        let notifier = Arc::new(RecordingNotifier::default());

        let before = SafeModeController::new(
            "TERM-A",
            &db,
            Arc::new(RecordingSink::default()),
            notifier.clone(),
        );
        before.on_power_state(PowerState::Critical).await.unwrap();
        let parked = receipt(1);
        before.submit_hardware_job(parked.clone()).await.unwrap();
        drop(before);

        // Power came back while the process was down
        let sink = Arc::new(RecordingSink::default());
        let after = SafeModeController::new("TERM-A", &db, sink.clone(), notifier.clone());
        assert_eq!(after.pending_jobs().await.unwrap(), 1);

        assert_eq!(after.on_power_state(PowerState::Online).await.unwrap(), None);
        assert_eq!(after.pending_jobs().await.unwrap(), 0);
        let ids: Vec<String> = sink.dispatched().into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![parked.job_id]);

        // Nothing left to send on the next reading
        after.on_power_state(PowerState::Online).await.unwrap();
        assert_eq!(sink.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_exit_dispatch_retried_on_later_reading() {
        let (sink, _notifier, controller) = controller().await;
        controller.on_power_state(PowerState::Critical).await.unwrap();
        controller.submit_hardware_job(receipt(1)).await.unwrap();

        sink.set_failing(true);
        controller.on_power_state(PowerState::Online).await.unwrap();
        assert_eq!(controller.pending_jobs().await.unwrap(), 1);

        sink.set_failing(false);
        controller.on_power_state(PowerState::NotDetected).await.unwrap();
        assert_eq!(controller.pending_jobs().await.unwrap(), 0);
        assert_eq!(sink.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_normal_mode_dispatches_immediately() {
        let (sink, _notifier, controller) = controller().await;
        assert_eq!(
            controller.submit_hardware_job(receipt(9)).await.unwrap(),
            SubmitOutcome::Dispatched
        );
        assert_eq!(sink.dispatched().len(), 1);
        assert_eq!(controller.pending_jobs().await.unwrap(), 0);
    }
}
