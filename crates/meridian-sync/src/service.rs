//! # Resilience Service
//!
//! Supervisor that wires the resilience components together and drives
//! them from background loops.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ResilienceService                                │
//! │                                                                         │
//! │  start():  register ► begin_recovery ► spawn loops                      │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  │
//! │  │ heartbeat    │  │ sync         │  │ power        │  │ sweep      │  │
//! │  │ every 30s    │  │ every 60s    │  │ every 30s    │  │ hourly     │  │
//! │  │ (+ stale     │  │ run_cycle()  │  │ poll()       │  │ checkpoints│  │
//! │  │  sweep on    │  │              │  │      │       │  │ + journal  │  │
//! │  │  authority)  │  │              │  │      ▼ watch │  │            │  │
//! │  └──────────────┘  └──────────────┘  │ safe-mode    │  └────────────┘  │
//! │                                      │ reactor      │                  │
//! │                                      └──────────────┘                  │
//! │                                                                         │
//! │  Every loop watches one stop channel. shutdown() flips it and awaits   │
//! │  the tasks, so a running stage completes before the process exits.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use meridian_core::{PowerHealth, PowerSnapshot, TerminalRole};
use meridian_db::Database;

use crate::checkpoint::TransactionCheckpoints;
use crate::config::ResilienceConfig;
use crate::coordinator::{CoordinatorSettings, CycleState, SyncCycleResult, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::journal::TransactionJournal;
use crate::network::{ConnectivityProbe, NetworkMonitor, TcpConnectivityProbe};
use crate::notify::{Notifier, TracingNotifier};
use crate::power::{source_from_settings, PowerMonitor, PowerSource};
use crate::registry::TerminalRegistry;
use crate::safe_mode::{AdmissionGate, HardwareSink, SafeModeController, TracingSink};
use crate::store::{open_authoritative, RecordStore, SharedPathStore, SqliteRecordStore};

/// Heartbeats missed before the authoritative terminal marks a peer offline.
const STALE_HEARTBEATS: u64 = 3;

// =============================================================================
// Status
// =============================================================================

/// Point-in-time view of the service for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStatus {
    pub terminal_id: String,
    pub role: TerminalRole,
    pub safe_mode: bool,
    pub power: Option<PowerSnapshot>,
    pub power_health: PowerHealth,
    pub last_sync: Option<SyncCycleResult>,
    pub cycle: CycleState,
    pub awaiting_recovery: Vec<String>,
}

// =============================================================================
// Service
// =============================================================================

/// A configured but not yet started service.
pub struct ResilienceService {
    config: Arc<ResilienceConfig>,
    db: Database,
    registry_db: Option<Database>,
    record_store: Arc<dyn RecordStore>,
    probe: Arc<dyn ConnectivityProbe>,
    power_source: Arc<dyn PowerSource>,
    sink: Arc<dyn HardwareSink>,
    notifier: Arc<dyn Notifier>,
    app_version: Option<String>,
}

impl ResilienceService {
    /// Registers the terminal, locks interrupted sessions and spawns the loops.
    pub async fn start(self) -> SyncResult<ResilienceHandle> {
        let config = self.config;
        info!(role = %config.terminal.role, name = %config.terminal.name, "Starting resilience service");

        let registry_db = match self.registry_db {
            Some(db) => db,
            None => default_registry_database(&config, &self.db).await,
        };
        let registry = TerminalRegistry::new(&registry_db);
        let terminal_id = registry
            .register(config.registration(self.app_version.as_deref()))
            .await?;

        let safe_mode = Arc::new(SafeModeController::new(
            terminal_id.clone(),
            &self.db,
            self.sink,
            self.notifier.clone(),
        ));

        let checkpoints = TransactionCheckpoints::new(
            terminal_id.clone(),
            &self.db,
            safe_mode.gate(),
            config.retention(),
            self.notifier.clone(),
        );
        checkpoints.begin_recovery().await?;

        let journal = TransactionJournal::new(&self.db, config.sync.max_retries);

        let network = NetworkMonitor::new(
            config.terminal.role,
            config.authoritative.address.clone(),
            config.authoritative.data_path.clone(),
            config.probe_timeout(),
            self.probe,
        )
        .with_registry(registry.clone());

        let (stop_tx, stop_rx) = watch::channel(false);

        let coordinator = Arc::new(
            SyncCoordinator::new(
                CoordinatorSettings::from_config(&config, terminal_id.clone()),
                &self.db,
                network,
                journal.clone(),
                self.record_store,
                registry.clone(),
                self.notifier,
            )
            .with_stop(stop_rx.clone()),
        );

        let power = Arc::new(PowerMonitor::new(
            terminal_id.clone(),
            &self.db,
            self.power_source,
            config.thresholds(),
            Duration::from_secs(config.power.query_timeout_secs),
        ));
        debug!(source = power.source_name(), "Power source selected");

        let stale_after =
            chrono::Duration::seconds((config.intervals.heartbeat_secs * STALE_HEARTBEATS) as i64);

        let tasks = vec![
            tokio::spawn(heartbeat_loop(
                registry.clone(),
                terminal_id.clone(),
                safe_mode.gate(),
                config.is_authoritative().then_some(stale_after),
                config.heartbeat_interval(),
                stop_rx.clone(),
            )),
            tokio::spawn(sync_loop(
                coordinator.clone(),
                config.sync_interval(),
                stop_rx.clone(),
            )),
            tokio::spawn(power_loop(
                power.clone(),
                config.power_interval(),
                config.power_error_backoff(),
                stop_rx.clone(),
            )),
            tokio::spawn(safe_mode_reactor(
                safe_mode.clone(),
                power.subscribe(),
                stop_rx.clone(),
            )),
            tokio::spawn(sweep_loop(
                checkpoints.clone(),
                journal.clone(),
                config.retention(),
                config.sweep_interval(),
                stop_rx,
            )),
        ];

        info!(terminal_id = %terminal_id, tasks = tasks.len(), "Resilience service started");

        Ok(ResilienceHandle {
            terminal_id,
            role: config.terminal.role,
            registry,
            journal,
            checkpoints,
            safe_mode,
            power,
            coordinator,
            stop: stop_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running service.
pub struct ResilienceHandle {
    terminal_id: String,
    role: TerminalRole,
    registry: TerminalRegistry,
    journal: TransactionJournal,
    checkpoints: TransactionCheckpoints,
    safe_mode: Arc<SafeModeController>,
    power: Arc<PowerMonitor>,
    coordinator: Arc<SyncCoordinator>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResilienceHandle {
    /// The id this terminal registered under.
    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub async fn status(&self) -> ResilienceStatus {
        let cycle = self.coordinator.state().await;
        ResilienceStatus {
            terminal_id: self.terminal_id.clone(),
            role: self.role,
            safe_mode: self.safe_mode.is_active(),
            power: self.power.current(),
            power_health: self.power.health(),
            last_sync: cycle.last_result.clone(),
            cycle,
            awaiting_recovery: self.checkpoints.awaiting_recovery().await,
        }
    }

    /// Admission gate for the sale path.
    pub fn gate(&self) -> AdmissionGate {
        self.safe_mode.gate()
    }

    pub fn checkpoints(&self) -> &TransactionCheckpoints {
        &self.checkpoints
    }

    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    pub fn registry(&self) -> &TerminalRegistry {
        &self.registry
    }

    pub fn safe_mode(&self) -> &SafeModeController {
        &self.safe_mode
    }

    pub fn power(&self) -> &PowerMonitor {
        &self.power
    }

    /// Runs a sync cycle now. Skipped if one is already running.
    pub async fn sync_now(&self) -> SyncCycleResult {
        self.coordinator.sync_now().await
    }

    /// Stops every loop and waits for them, then marks the terminal offline.
    pub async fn shutdown(&self) -> SyncResult<()> {
        info!(terminal_id = %self.terminal_id, "Shutting down resilience service");
        self.stop.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Resilience task ended abnormally");
            }
        }

        self.registry.mark_offline(&self.terminal_id).await?;
        info!(terminal_id = %self.terminal_id, "Resilience service stopped");
        Ok(())
    }
}

// =============================================================================
// Loops
// =============================================================================

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Waits for the next tick. Returns false once stop was requested.
async fn next_tick(ticker: &mut Interval, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = ticker.tick() => !*stop.borrow(),
        changed = stop.changed() => changed.is_ok() && !*stop.borrow(),
    }
}

/// Sleeps unless stop arrives first. Returns false on stop.
async fn pause(period: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => !*stop.borrow(),
        changed = stop.changed() => changed.is_ok() && !*stop.borrow(),
    }
}

async fn heartbeat_loop(
    registry: TerminalRegistry,
    terminal_id: String,
    gate: AdmissionGate,
    stale_after: Option<chrono::Duration>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(period_secs = period.as_secs(), "Heartbeat loop started");
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &mut stop).await {
        let beat = if gate.is_safe_mode_active() {
            registry.mark_degraded(&terminal_id).await
        } else {
            registry.heartbeat(&terminal_id).await
        };
        if let Err(e) = beat {
            warn!(error = %e, "Heartbeat failed");
        }

        if let Some(timeout) = stale_after {
            match registry.sweep_stale(&terminal_id, timeout).await {
                Ok(stale) if !stale.is_empty() => {
                    warn!(count = stale.len(), terminals = ?stale, "Terminals went silent");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Stale terminal sweep failed"),
            }
        }
    }

    info!("Heartbeat loop stopped");
}

async fn sync_loop(
    coordinator: Arc<SyncCoordinator>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(period_secs = period.as_secs(), "Sync loop started");
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &mut stop).await {
        let result = coordinator.run_cycle().await;
        debug!(
            outcome = ?result.outcome,
            records = result.records_synced,
            entries = result.entries_applied,
            "Sync tick done"
        );
    }

    info!("Sync loop stopped");
}

async fn power_loop(
    power: Arc<PowerMonitor>,
    period: Duration,
    error_backoff: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(period_secs = period.as_secs(), source = power.source_name(), "Power loop started");
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &mut stop).await {
        let failed = match power.poll().await {
            Ok(poll) => poll.source_error.is_some(),
            Err(e) => {
                error!(error = %e, "Power poll failed");
                true
            }
        };

        if failed {
            debug!(backoff_secs = error_backoff.as_secs(), "Backing off power source");
            if !pause(error_backoff, &mut stop).await {
                break;
            }
            ticker.reset();
        }
    }

    info!("Power loop stopped");
}

/// Applies every new power classification to the safe mode controller.
async fn safe_mode_reactor(
    safe_mode: Arc<SafeModeController>,
    mut power: watch::Receiver<Option<PowerSnapshot>>,
    mut stop: watch::Receiver<bool>,
) {
    info!("Safe mode reactor started");

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = power.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let state = power.borrow_and_update().as_ref().map(|s| s.state);
        if let Some(state) = state {
            if let Err(e) = safe_mode.on_power_state(state).await {
                error!(power_state = %state, error = %e, "Safe mode transition failed");
            }
        }
    }

    info!("Safe mode reactor stopped");
}

async fn sweep_loop(
    checkpoints: TransactionCheckpoints,
    journal: TransactionJournal,
    retention: chrono::Duration,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(period_secs = period.as_secs(), "Sweep loop started");
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &mut stop).await {
        if let Err(e) = checkpoints.sweep(chrono::Utc::now()).await {
            warn!(error = %e, "Checkpoint sweep failed");
        }
        if let Err(e) = journal.purge_applied(retention).await {
            warn!(error = %e, "Journal purge failed");
        }
    }

    info!("Sweep loop stopped");
}

/// A satellite on a data path registers in the authoritative database,
/// the file [`SharedPathStore`] syncs against. Everyone else, and a
/// satellite whose share is not mounted yet, uses the local database.
async fn default_registry_database(config: &ResilienceConfig, local: &Database) -> Database {
    let path = match config.authoritative_database_path() {
        Some(path) if !config.is_authoritative() => path,
        _ => return local.clone(),
    };

    match open_authoritative(&path).await {
        Ok(db) => {
            debug!(path = %path.display(), "Registry on the authoritative database");
            db
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Authoritative database unavailable, registering locally");
            local.clone()
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ResilienceService`]. Only the database is required.
pub struct ResilienceServiceBuilder {
    config: ResilienceConfig,
    db: Option<Database>,
    registry_db: Option<Database>,
    record_store: Option<Arc<dyn RecordStore>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    power_source: Option<Arc<dyn PowerSource>>,
    sink: Option<Arc<dyn HardwareSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    app_version: Option<String>,
}

impl ResilienceServiceBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        ResilienceServiceBuilder {
            config,
            db: None,
            registry_db: None,
            record_store: None,
            probe: None,
            power_source: None,
            sink: None,
            notifier: None,
            app_version: None,
        }
    }

    /// Sets the local database.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Keeps registry rows in a given database instead of the default.
    pub fn with_registry_database(mut self, db: Database) -> Self {
        self.registry_db = Some(db);
        self
    }

    /// Sets where records are pushed to and pulled from.
    pub fn with_record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_power_source(mut self, source: Arc<dyn PowerSource>) -> Self {
        self.power_source = Some(source);
        self
    }

    pub fn with_hardware_sink(mut self, sink: Arc<dyn HardwareSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    pub fn build(self) -> SyncResult<ResilienceService> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;

        let record_store = match self.record_store {
            Some(store) => store,
            None if self.config.is_authoritative() => Arc::new(SqliteRecordStore::new(&db)),
            None => match self.config.authoritative_database_path() {
                Some(path) => Arc::new(SharedPathStore::new(path)),
                None => {
                    return Err(SyncError::InvalidConfig(
                        "a satellite needs authoritative.data_path or a record store".into(),
                    ))
                }
            },
        };

        let power_source = self
            .power_source
            .unwrap_or_else(|| source_from_settings(&self.config.power));

        Ok(ResilienceService {
            registry_db: self.registry_db,
            db,
            record_store,
            probe: self.probe.unwrap_or_else(|| Arc::new(TcpConnectivityProbe)),
            power_source,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
            app_version: self.app_version,
            config: Arc::new(self.config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notification;
    use crate::power::SimulatedSource;
    use crate::testing::{memory_db, FakeProbe, MemoryRecordStore, RecordingNotifier};
    use meridian_core::journal::SaleLine;
    use meridian_db::DbConfig;
    use meridian_core::{TerminalStatus, TransactionSnapshot};
    use std::future::Future;

    fn authoritative_config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.terminal.role = TerminalRole::Authoritative;
        config.terminal.name = "Back Office".into();
        config.terminal.hardware_fingerprint = Some("fp-back-office".into());
        config.intervals.heartbeat_secs = 1;
        config.intervals.sync_secs = 1;
        config.intervals.power_secs = 1;
        config
    }

    /// Polls `check` until it holds or five seconds pass.
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_build_requires_database() {
        let result = ResilienceServiceBuilder::new(authoritative_config()).build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(ref m)) if m == "Database required"));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = authoritative_config();
        config.power.critical_threshold = 50;

        let result = ResilienceServiceBuilder::new(config)
            .with_database(memory_db().await)
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_registers_and_shutdown_marks_offline() {
        let db = memory_db().await;
        let service = ResilienceServiceBuilder::new(authoritative_config())
            .with_database(db.clone())
            .with_probe(Arc::new(FakeProbe::up()))
            .with_power_source(Arc::new(SimulatedSource::on_mains()))
            .with_app_version("1.4.0")
            .build()
            .unwrap();

        let handle = service.start().await.unwrap();
        let id = handle.terminal_id().to_string();

        let terminal = handle.registry().get(&id).await.unwrap().unwrap();
        assert_eq!(terminal.status, TerminalStatus::Online);
        assert_eq!(terminal.app_version.as_deref(), Some("1.4.0"));

        let status = handle.status().await;
        assert_eq!(status.role, TerminalRole::Authoritative);
        assert!(!status.safe_mode);
        assert!(handle.gate().admit_new_transaction().is_ok());

        handle.shutdown().await.unwrap();
        let terminal = TerminalRegistry::new(&db).get(&id).await.unwrap().unwrap();
        assert_eq!(terminal.status, TerminalStatus::Offline);
    }

    #[tokio::test]
    async fn test_start_locks_interrupted_sessions() {
        let db = memory_db().await;
        let mut config = authoritative_config();
        config.terminal.id = Some("TERM-0000AAAA".into());

        let snapshot = TransactionSnapshot::Sale {
            lines: vec![SaleLine {
                product_id: "p-9".into(),
                quantity: 1,
                unit_price_cents: 1299,
            }],
            customer_id: None,
            tendered_cents: 0,
            step: "payment".into(),
        };
        let now = chrono::Utc::now();
        db.transaction_checkpoints()
            .save("TERM-0000AAAA", "s-1", &snapshot, "tender", now, now + chrono::Duration::hours(48))
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let handle = ResilienceServiceBuilder::new(config)
            .with_database(db)
            .with_probe(Arc::new(FakeProbe::up()))
            .with_power_source(Arc::new(SimulatedSource::on_mains()))
            .with_notifier(notifier.clone())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(handle.terminal_id(), "TERM-0000AAAA");
        assert_eq!(handle.status().await.awaiting_recovery, vec!["s-1"]);
        assert!(notifier
            .events()
            .contains(&Notification::RecoveryPending { count: 1 }));
        assert!(matches!(
            handle.checkpoints().save("s-1", &snapshot, "tender").await,
            Err(SyncError::RecoveryRequired { .. })
        ));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_low_battery_drives_safe_mode_through_loops() {
        let db = memory_db().await;
        let source = Arc::new(SimulatedSource::on_mains());
        let handle = ResilienceServiceBuilder::new(authoritative_config())
            .with_database(db)
            .with_probe(Arc::new(FakeProbe::up()))
            .with_power_source(source.clone())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        let h = &handle;
        let id = handle.terminal_id();

        source.set_battery(5.0, false);
        assert!(eventually(move || async move { h.gate().is_safe_mode_active() }).await);
        assert!(handle.gate().admit_new_transaction().is_err());

        assert!(
            eventually(move || async move {
                let terminal = h.registry().get(id).await.unwrap().unwrap();
                terminal.status == TerminalStatus::Degraded
            })
            .await
        );

        source.set_battery(100.0, true);
        assert!(eventually(move || async move { !h.gate().is_safe_mode_active() }).await);
        assert_eq!(handle.status().await.power_health, PowerHealth::Healthy);

        handle.shutdown().await.unwrap();
    }

    fn data_path_config(dir: &std::path::Path) -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.terminal.name = "Lane 3".into();
        config.terminal.hardware_fingerprint = Some("fp-lane-3".into());
        config.authoritative.data_path = Some(dir.to_path_buf());
        config
    }

    #[tokio::test]
    async fn test_satellite_on_data_path_registers_in_authoritative_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = data_path_config(dir.path());
        let shared_path = config.authoritative_database_path().unwrap();
        let shared = Database::new(DbConfig::new(&shared_path)).await.unwrap();
        let local = memory_db().await;

        let handle = ResilienceServiceBuilder::new(config)
            .with_database(local.clone())
            .with_probe(Arc::new(FakeProbe::up()))
            .with_power_source(Arc::new(SimulatedSource::on_mains()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        let id = handle.terminal_id().to_string();

        let listed = TerminalRegistry::new(&shared).list().await.unwrap();
        assert!(listed.iter().any(|t| t.terminal_id == id));
        assert!(TerminalRegistry::new(&local).get(&id).await.unwrap().is_none());

        handle.shutdown().await.unwrap();
        let terminal = TerminalRegistry::new(&shared).get(&id).await.unwrap().unwrap();
        assert_eq!(terminal.status, TerminalStatus::Offline);
        shared.close().await;
    }

    #[tokio::test]
    async fn test_satellite_registers_locally_while_share_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let local = memory_db().await;

        let handle = ResilienceServiceBuilder::new(data_path_config(&dir.path().join("unmounted")))
            .with_database(local.clone())
            .with_probe(Arc::new(FakeProbe::up()))
            .with_power_source(Arc::new(SimulatedSource::on_mains()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let id = handle.terminal_id().to_string();
        assert!(TerminalRegistry::new(&local).get(&id).await.unwrap().is_some());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_now_on_satellite_pushes_journal() {
        let db = memory_db().await;
        let mut config = ResilienceConfig::default();
        config.terminal.hardware_fingerprint = Some("fp-lane-2".into());
        config.authoritative.address = Some("192.168.1.10:5000".into());

        let store = Arc::new(MemoryRecordStore::new());
        let handle = ResilienceServiceBuilder::new(config)
            .with_database(db)
            .with_record_store(store.clone())
            .with_probe(Arc::new(FakeProbe::up()))
            .with_power_source(Arc::new(SimulatedSource::on_mains()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let id = handle.terminal_id().to_string();
        handle
            .journal()
            .enqueue(crate::testing::customer_entry(&id, "c-1", "Ada", 1_700_000_000))
            .await
            .unwrap();

        // The periodic loop may win the race; either way the entry lands
        let (h, s) = (&handle, &store);
        assert!(
            eventually(move || async move {
                h.sync_now().await;
                s.record("customers", "c-1").is_some()
            })
            .await
        );
        assert_eq!(handle.journal().count_pending().await.unwrap(), 0);

        handle.shutdown().await.unwrap();
    }
}
