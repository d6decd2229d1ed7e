//! # Sync Coordinator
//!
//! One sync cycle moves this terminal's journal to the authoritative store
//! and pulls back what other terminals changed.
//!
//! ## Cycle
//! ```text
//! ┌──────┐   ┌─────────┐   ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌───────────────┐
//! │ Idle │──►│ Probing │──►│ Draining │──►│ Pulling │──►│ Resolving │──►│ Checkpointing │──► Idle
//! └──────┘   └────┬────┘   └────┬─────┘   └────┬────┘   └─────┬─────┘   └───────────────┘
//!                 │             │              │              │
//!                 └─────────────┴──────────────┴──────────────┴──► Failed ──► Idle
//! ```
//!
//! - **Draining** pushes journal entries oldest first. A failing entry is
//!   charged a retry and the drain moves on; only a store outage stops it.
//! - **Pulling** reads records after each table's marker (skipped on the
//!   authoritative terminal).
//! - **Resolving** applies pulled records, runs the conflict resolver on
//!   concurrent edits and retries older unresolved conflicts.
//! - **Checkpointing** advances each marker past the records processed.
//!
//! Work committed before a failure is kept. A re-entrant trigger while a
//! cycle is running returns `Skipped`.

use chrono::{DateTime, Utc};
use futures_util::{pin_mut, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use meridian_core::{
    ConflictRecord, ConflictResolver, ConflictState, JournalEntry, JournalStatus, NewConflict,
    RecordVersion, Resolution, StoreRecord, SyncMarker, SyncStatus, TerminalRole, Winner,
};
use meridian_db::{ConflictRepository, Database, RecordRepository, SyncCheckpointRepository};

use crate::config::ResilienceConfig;
use crate::error::{SyncError, SyncResult};
use crate::journal::TransactionJournal;
use crate::network::NetworkMonitor;
use crate::notify::{Notification, Notifier};
use crate::registry::TerminalRegistry;
use crate::store::RecordStore;

/// Unresolved conflicts retried per cycle.
const CONFLICT_RETRY_BATCH: u32 = 100;

const SUPERSEDED: &str = "superseded by a newer write";

// =============================================================================
// Cycle Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Idle,
    Probing,
    Draining,
    Pulling,
    Resolving,
    Checkpointing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    /// Another cycle was already running.
    Skipped,
    Failed,
    /// A stop request ended the cycle between stages.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncCycleResult {
    pub outcome: CycleOutcome,
    pub synced_tables: Vec<String>,
    pub records_synced: u64,
    pub entries_applied: u64,
    pub entries_failed: u64,
    pub entries_dead_lettered: u64,
    pub corrupt_records: u64,
    pub conflicts_resolved: u64,
    pub conflicts_unresolved: u64,
    pub errors: Vec<String>,
    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub finished_at: DateTime<Utc>,
}

impl SyncCycleResult {
    fn new(started_at: DateTime<Utc>) -> Self {
        SyncCycleResult {
            outcome: CycleOutcome::Completed,
            synced_tables: Vec::new(),
            records_synced: 0,
            entries_applied: 0,
            entries_failed: 0,
            entries_dead_lettered: 0,
            corrupt_records: 0,
            conflicts_resolved: 0,
            conflicts_unresolved: 0,
            errors: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    fn skipped() -> Self {
        let mut result = SyncCycleResult::new(Utc::now());
        result.outcome = CycleOutcome::Skipped;
        result
    }
}

/// What the coordinator is doing right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CycleState {
    pub stage: CycleStage,
    pub cycles_run: u64,
    pub last_result: Option<SyncCycleResult>,
}

/// Coordinator tuning, usually taken from [`ResilienceConfig`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub terminal_id: String,
    pub role: TerminalRole,
    pub tracked_tables: Vec<String>,
    pub batch_size: u32,
    pub network_alert_threshold: u32,
    pub max_conflict_retries: u32,
    pub max_clock_skew: chrono::Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &ResilienceConfig, terminal_id: impl Into<String>) -> Self {
        CoordinatorSettings {
            terminal_id: terminal_id.into(),
            role: config.terminal.role,
            tracked_tables: config.sync.tracked_tables.clone(),
            batch_size: config.sync.batch_size,
            network_alert_threshold: config.sync.network_alert_threshold,
            max_conflict_retries: config.sync.max_conflict_retries,
            max_clock_skew: chrono::Duration::seconds(config.sync.max_clock_skew_secs),
        }
    }
}

/// Records pulled for one table, with the marker they were read after.
struct TableBatch {
    table: String,
    marker: SyncMarker,
    records: Vec<StoreRecord>,
}

/// Per-cycle bookkeeping.
struct CycleWork {
    result: SyncCycleResult,
    /// Conflicts recorded in this cycle; not retried until the next one.
    fresh_conflicts: HashSet<i64>,
    markers: HashMap<String, SyncMarker>,
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct SyncCoordinator {
    settings: CoordinatorSettings,
    network: NetworkMonitor,
    journal: TransactionJournal,
    remote: Arc<dyn RecordStore>,
    local: RecordRepository,
    checkpoints: SyncCheckpointRepository,
    conflicts: ConflictRepository,
    registry: TerminalRegistry,
    resolver: ConflictResolver,
    notifier: Arc<dyn Notifier>,
    guard: Mutex<()>,
    state: RwLock<CycleState>,
    stop: Option<watch::Receiver<bool>>,
}

impl SyncCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        db: &Database,
        network: NetworkMonitor,
        journal: TransactionJournal,
        remote: Arc<dyn RecordStore>,
        registry: TerminalRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let resolver = ConflictResolver::new(settings.max_clock_skew);
        SyncCoordinator {
            settings,
            network,
            journal,
            remote,
            local: db.records(),
            checkpoints: db.sync_checkpoints(),
            conflicts: db.conflicts(),
            registry,
            resolver,
            notifier,
            guard: Mutex::new(()),
            state: RwLock::new(CycleState {
                stage: CycleStage::Idle,
                cycles_run: 0,
                last_result: None,
            }),
            stop: None,
        }
    }

    /// Stop signal checked between stages.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub async fn state(&self) -> CycleState {
        self.state.read().await.clone()
    }

    /// Runs a cycle on demand. Same guard as the periodic loop.
    pub async fn sync_now(&self) -> SyncCycleResult {
        info!(terminal_id = %self.settings.terminal_id, "Manual sync requested");
        self.run_cycle().await
    }

    pub async fn run_cycle(&self) -> SyncCycleResult {
        let Ok(_guard) = self.guard.try_lock() else {
            debug!("Sync cycle already running, skipping");
            return SyncCycleResult::skipped();
        };

        let mut work = CycleWork {
            result: SyncCycleResult::new(Utc::now()),
            fresh_conflicts: HashSet::new(),
            markers: HashMap::new(),
        };

        let outcome = match self.execute(&mut work).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.set_stage(CycleStage::Failed).await;
                warn!(terminal_id = %self.settings.terminal_id, error = %e, "Sync cycle failed");
                work.result.errors.push(e.to_string());
                CycleOutcome::Failed
            }
        };

        self.finish(work.result, outcome).await
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    async fn set_stage(&self, stage: CycleStage) {
        self.state.write().await.stage = stage;
    }

    async fn execute(&self, work: &mut CycleWork) -> SyncResult<CycleOutcome> {
        // Stage 1: reachability
        self.set_stage(CycleStage::Probing).await;
        let report = self.network.probe().await;
        if !report.reachable {
            let message = report
                .error_message
                .unwrap_or_else(|| "authoritative terminal unreachable".into());
            let failures = self.network.consecutive_failures();
            if failures >= self.settings.network_alert_threshold {
                warn!(failures, stage = %report.stage, %message, "Authoritative terminal unreachable");
                self.notifier.notify(&Notification::NetworkUnavailable {
                    consecutive_failures: failures,
                    message: message.clone(),
                });
            } else {
                debug!(failures, stage = %report.stage, %message, "Authoritative terminal unreachable");
            }
            return Err(SyncError::NetworkUnavailable(message));
        }
        if self.stop_requested() {
            return Ok(CycleOutcome::Interrupted);
        }

        // Stage 2: push the journal
        self.set_stage(CycleStage::Draining).await;
        self.drain(work).await?;
        if self.stop_requested() {
            return Ok(CycleOutcome::Interrupted);
        }

        // Stage 3: fetch remote changes
        let batches = if self.settings.role.is_authoritative() {
            Vec::new()
        } else {
            self.set_stage(CycleStage::Pulling).await;
            self.pull(work).await?
        };
        if self.stop_requested() {
            return Ok(CycleOutcome::Interrupted);
        }

        // Stage 4: apply and resolve
        self.set_stage(CycleStage::Resolving).await;
        let advanced = self.apply_batches(batches, work).await?;
        self.retry_conflicts(work).await?;
        if self.stop_requested() {
            return Ok(CycleOutcome::Interrupted);
        }

        // Stage 5: markers
        self.set_stage(CycleStage::Checkpointing).await;
        let now = Utc::now();
        for (table, marker) in advanced {
            self.checkpoints
                .advance(&self.settings.terminal_id, &table, &marker, now)
                .await?;
        }

        Ok(CycleOutcome::Completed)
    }

    async fn finish(&self, mut result: SyncCycleResult, outcome: CycleOutcome) -> SyncCycleResult {
        result.outcome = outcome;
        result.finished_at = Utc::now();

        let pending = match self.journal.count_pending().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Could not count pending journal entries");
                0
            }
        };
        let unresolved = self.conflicts.count_unresolved().await.unwrap_or(0);

        let sync_status = match outcome {
            CycleOutcome::Failed => SyncStatus::Failed,
            CycleOutcome::Interrupted | CycleOutcome::Skipped => SyncStatus::Pending,
            CycleOutcome::Completed if unresolved > 0 => SyncStatus::Conflict,
            CycleOutcome::Completed if !result.errors.is_empty() => SyncStatus::Failed,
            CycleOutcome::Completed => SyncStatus::Synced,
        };

        if let Err(e) = self
            .registry
            .record_sync(&self.settings.terminal_id, sync_status, pending)
            .await
        {
            warn!(terminal_id = %self.settings.terminal_id, error = %e, "Could not record sync status");
        }

        {
            let mut state = self.state.write().await;
            state.stage = CycleStage::Idle;
            state.cycles_run += 1;
            state.last_result = Some(result.clone());
        }

        match outcome {
            CycleOutcome::Completed => info!(
                applied = result.entries_applied,
                failed = result.entries_failed,
                pulled = result.records_synced,
                conflicts = result.conflicts_resolved + result.conflicts_unresolved,
                pending,
                "Sync cycle complete"
            ),
            _ => info!(?outcome, pending, "Sync cycle ended"),
        }

        result
    }

    // =========================================================================
    // Draining
    // =========================================================================

    async fn drain(&self, work: &mut CycleWork) -> SyncResult<()> {
        let entries = self.journal.pending_entries(None);
        pin_mut!(entries);

        while let Some(item) = entries.next().await {
            let entry = match item {
                Ok(entry) => entry,
                Err(SyncError::CorruptJournalRecord { seq, reason }) => {
                    self.journal.quarantine(seq, &reason).await?;
                    work.result.corrupt_records += 1;
                    self.notifier.notify(&Notification::DeadLettered { seq, reason });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let seq = entry.seq;
            match self.push_entry(&entry, work).await {
                Ok(()) => {
                    self.journal.mark_applied(seq).await?;
                    work.result.entries_applied += 1;
                }
                // The store went away; nothing is charged and the cycle ends
                Err(e @ SyncError::StoreUnavailable(_)) | Err(e @ SyncError::DatabaseError(_)) => {
                    return Err(e)
                }
                Err(e) => {
                    let reason = e.to_string();
                    let status = self.journal.mark_failed(seq, &reason).await?;
                    work.result.errors.push(format!("journal entry {}: {}", seq, reason));
                    if status == JournalStatus::DeadLetter {
                        error!(seq, %reason, "Journal entry dead-lettered");
                        work.result.entries_dead_lettered += 1;
                        self.notifier
                            .notify(&Notification::DeadLettered { seq, reason });
                    } else {
                        warn!(seq, %reason, "Journal entry failed, will retry");
                        work.result.entries_failed += 1;
                    }
                }
            }
        }

        Ok(())
    }

    /// Writes one entry to the authoritative store unless a newer version
    /// from another terminal wins.
    async fn push_entry(&self, entry: &JournalEntry, work: &mut CycleWork) -> SyncResult<()> {
        let local = entry.to_record()?;
        let marker = self.marker_for(&local.table_name, work).await?;

        if let Some(remote) = self.remote.get(&local.table_name, &local.record_id).await? {
            if remote.same_content(&local) {
                return Ok(());
            }

            // A later write of ours already landed; this is a retried older entry
            if remote.modified_by == self.settings.terminal_id
                && remote.modified_at > local.modified_at
            {
                debug!(seq = entry.seq, record_id = %local.record_id, "Entry superseded by a newer write");
                return Ok(());
            }

            let concurrent = remote.modified_by != self.settings.terminal_id
                && (marker.precedes(&remote) || remote.modified_at >= local.modified_at);
            if concurrent {
                let winner = self.record_conflict(&local, &remote, work).await?;
                if winner != Some(Winner::Local) {
                    debug!(seq = entry.seq, record_id = %local.record_id, "Entry settled by conflict");
                    return Ok(());
                }
            }
        }

        self.remote.upsert(&local).await
    }

    async fn marker_for(&self, table: &str, work: &mut CycleWork) -> SyncResult<SyncMarker> {
        if let Some(marker) = work.markers.get(table) {
            return Ok(marker.clone());
        }
        let marker = self
            .checkpoints
            .marker(&self.settings.terminal_id, table)
            .await?;
        work.markers.insert(table.to_string(), marker.clone());
        Ok(marker)
    }

    // =========================================================================
    // Pulling / Resolving
    // =========================================================================

    async fn pull(&self, work: &mut CycleWork) -> SyncResult<Vec<TableBatch>> {
        let mut batches = Vec::with_capacity(self.settings.tracked_tables.len());

        for table in &self.settings.tracked_tables {
            let marker = self.marker_for(table, work).await?;
            match self
                .remote
                .modified_since(table, &marker, self.settings.batch_size)
                .await
            {
                Ok(records) => {
                    debug!(%table, count = records.len(), "Pulled remote changes");
                    batches.push(TableBatch {
                        table: table.clone(),
                        marker,
                        records,
                    });
                }
                Err(e @ SyncError::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    warn!(%table, error = %e, "Pull failed for table");
                    work.result.errors.push(format!("{}: {}", table, e));
                }
            }
        }

        Ok(batches)
    }

    /// Applies pulled records and returns the marker each table may advance to.
    async fn apply_batches(
        &self,
        batches: Vec<TableBatch>,
        work: &mut CycleWork,
    ) -> SyncResult<Vec<(String, SyncMarker)>> {
        let mut advanced = Vec::new();
        // Records stamped beyond the skew bound would drag the marker into
        // the future; they wait until the clock catches up.
        let horizon = Utc::now() + self.settings.max_clock_skew;

        for batch in batches {
            let mut last = None;
            for remote in &batch.records {
                if remote.modified_at > horizon {
                    debug!(table = %batch.table, record_id = %remote.record_id, "Pulled record is ahead of the clock, holding marker");
                    break;
                }
                match self.apply_pulled(&batch.marker, remote, work).await {
                    Ok(applied) => {
                        if applied {
                            work.result.records_synced += 1;
                        }
                        last = Some(remote.marker());
                    }
                    Err(e @ SyncError::StoreUnavailable(_)) => return Err(e),
                    Err(e) => {
                        warn!(table = %batch.table, record_id = %remote.record_id, error = %e, "Could not apply pulled record");
                        work.result
                            .errors
                            .push(format!("{}/{}: {}", batch.table, remote.record_id, e));
                        break;
                    }
                }
            }

            if let Some(marker) = last {
                work.result.synced_tables.push(batch.table.clone());
                advanced.push((batch.table, marker));
            }
        }

        Ok(advanced)
    }

    /// Returns true when the local replica changed.
    async fn apply_pulled(
        &self,
        marker: &SyncMarker,
        remote: &StoreRecord,
        work: &mut CycleWork,
    ) -> SyncResult<bool> {
        let me = self.settings.terminal_id.as_str();
        let Some(local) = self.local.get(&remote.table_name, &remote.record_id).await? else {
            self.local.upsert(remote).await?;
            return Ok(true);
        };

        if local.same_content(remote) {
            return Ok(false);
        }

        if local.modified_by == me {
            // Our own older write coming back: the newer local one is still queued
            if remote.modified_by == me && remote.modified_at <= local.modified_at {
                return Ok(false);
            }

            if remote.modified_by != me && marker.precedes(&local) {
                let winner = self.record_conflict(&local, remote, work).await?;
                if winner != Some(Winner::Remote) {
                    return Ok(false);
                }
            }
        }

        self.local.upsert(remote).await?;
        Ok(true)
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Resolves and records a conflict. Returns the winner to apply, or
    /// `None` while the conflict is unresolved.
    async fn record_conflict(
        &self,
        local: &StoreRecord,
        remote: &StoreRecord,
        work: &mut CycleWork,
    ) -> SyncResult<Option<Winner>> {
        let local_version = RecordVersion::from(local);
        let remote_version = RecordVersion::from(remote);
        let now = Utc::now();
        let resolution = self.resolver.resolve(&local_version, &remote_version, now);

        let conflict = NewConflict {
            table_name: local.table_name.clone(),
            record_id: local.record_id.clone(),
            local: local_version,
            remote: remote_version,
            resolution: resolution.clone(),
        };
        let (record, inserted) = self.conflicts.record(&conflict, now).await?;

        if inserted {
            work.fresh_conflicts.insert(record.id);
            match resolution {
                Resolution::Decided { winner, tie_broken } => {
                    work.result.conflicts_resolved += 1;
                    info!(
                        table = %record.table_name,
                        record_id = %record.record_id,
                        %winner,
                        tie_broken,
                        "Conflict resolved by last write"
                    );
                }
                Resolution::Deferred(ref reason) => {
                    work.result.conflicts_unresolved += 1;
                    warn!(
                        table = %record.table_name,
                        record_id = %record.record_id,
                        %reason,
                        "Conflict deferred"
                    );
                }
            }
            self.notifier.notify(&Notification::ConflictRecorded {
                table: record.table_name.clone(),
                record_id: record.record_id.clone(),
                winner: record.winner,
                state: record.state,
            });
        }

        Ok(match record.state {
            ConflictState::Resolved => record.winner,
            ConflictState::Unresolved => None,
        })
    }

    /// Re-runs the resolver on conflicts left unresolved by earlier cycles.
    async fn retry_conflicts(&self, work: &mut CycleWork) -> SyncResult<()> {
        let max = self.settings.max_conflict_retries;
        let candidates = self.conflicts.retryable(max, CONFLICT_RETRY_BATCH).await?;

        for conflict in candidates {
            if work.fresh_conflicts.contains(&conflict.id) {
                continue;
            }

            let resolution = self.resolver.resolve(
                &conflict.local_version(),
                &conflict.remote_version(),
                Utc::now(),
            );

            match resolution {
                Resolution::Decided { winner, .. } => {
                    let note = self.apply_retried(&conflict, winner).await?;
                    self.conflicts
                        .mark_resolved(conflict.id, winner, note, Utc::now())
                        .await?;
                    work.result.conflicts_resolved += 1;
                    info!(
                        table = %conflict.table_name,
                        record_id = %conflict.record_id,
                        %winner,
                        superseded = note.is_some(),
                        "Deferred conflict resolved"
                    );
                    self.notifier.notify(&Notification::ConflictRecorded {
                        table: conflict.table_name.clone(),
                        record_id: conflict.record_id.clone(),
                        winner: Some(winner),
                        state: ConflictState::Resolved,
                    });
                }
                Resolution::Deferred(reason) => {
                    let reason = reason.to_string();
                    let Some(attempts) = self.conflicts.record_retry(conflict.id, &reason).await?
                    else {
                        continue;
                    };
                    work.result.conflicts_unresolved += 1;
                    if attempts >= i64::from(max) {
                        let err = SyncError::ConflictUnresolved {
                            table: conflict.table_name.clone(),
                            record_id: conflict.record_id.clone(),
                            reason: reason.clone(),
                        };
                        warn!(error = %err, attempts, "Conflict left for manual review");
                        self.notifier.notify(&Notification::ConflictUnresolved {
                            table: conflict.table_name.clone(),
                            record_id: conflict.record_id.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Writes the winning version where the losing one still stands.
    /// Returns a note when a newer write got there first.
    async fn apply_retried(
        &self,
        conflict: &ConflictRecord,
        winner: Winner,
    ) -> SyncResult<Option<&'static str>> {
        let table = conflict.table_name.as_str();
        let id = conflict.record_id.as_str();

        match winner {
            Winner::Local => {
                let current = self.remote.get(table, id).await?;
                if !still_holds(current.as_ref(), &conflict.remote_version()) {
                    return Ok(Some(SUPERSEDED));
                }
                let record = version_record(table, id, &conflict.local_version())?;
                self.remote.upsert(&record).await?;
            }
            Winner::Remote => {
                let current = self.local.get(table, id).await?;
                if !still_holds(current.as_ref(), &conflict.local_version()) {
                    return Ok(Some(SUPERSEDED));
                }
                let record = version_record(table, id, &conflict.remote_version())?;
                self.local.upsert(&record).await?;
            }
        }
        Ok(None)
    }
}

fn still_holds(current: Option<&StoreRecord>, version: &RecordVersion) -> bool {
    current.is_some_and(|c| {
        c.data == version.snapshot
            && c.deleted == version.deleted
            && Some(c.modified_at) == version.modified_at
            && c.modified_by == version.terminal_id
    })
}

fn version_record(table: &str, record_id: &str, version: &RecordVersion) -> SyncResult<StoreRecord> {
    let modified_at = version.modified_at.ok_or_else(|| {
        SyncError::Internal(format!("{}/{} winner has no timestamp", table, record_id))
    })?;
    Ok(StoreRecord {
        table_name: table.to_string(),
        record_id: record_id.to_string(),
        data: version.snapshot.clone(),
        modified_at,
        modified_by: version.terminal_id.clone(),
        deleted: version.deleted,
    })
}
