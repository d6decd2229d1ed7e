//! Fakes for the collaborator traits, shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use meridian_core::{
    HardwareJob, JournalOperation, JournalPayload, NewJournalEntry, RecordSnapshot, StoreRecord,
    SyncMarker,
};
use meridian_db::{Database, DbConfig};

use crate::error::{SyncError, SyncResult};
use crate::network::ConnectivityProbe;
use crate::notify::{Notification, Notifier};
use crate::safe_mode::HardwareSink;
use crate::store::RecordStore;

pub async fn memory_db() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// A customer update written by `origin`.
pub fn customer_entry(origin: &str, id: &str, name: &str, secs: i64) -> NewJournalEntry {
    NewJournalEntry::new(
        JournalOperation::Update,
        JournalPayload::CustomerUpdate(RecordSnapshot {
            record_id: id.into(),
            data: json!({ "name": name }),
            modified_at: at(secs),
        }),
        origin,
    )
}

/// A record shaped like the ones `customer_entry` produces.
pub fn record_at(table: &str, id: &str, by: &str, secs: i64, name: &str) -> StoreRecord {
    StoreRecord {
        table_name: table.into(),
        record_id: id.into(),
        data: json!({ "name": name }),
        modified_at: at(secs),
        modified_by: by.into(),
        deleted: false,
    }
}

// =============================================================================
// Record Store
// =============================================================================

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<(String, String), StoreRecord>>,
    failing: Mutex<HashSet<String>>,
    fail_once: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    upserts: Mutex<Vec<StoreRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record without logging it as an upsert.
    pub fn insert(&self, record: StoreRecord) {
        self.records.lock().unwrap().insert(
            (record.table_name.clone(), record.record_id.clone()),
            record,
        );
    }

    pub fn record(&self, table: &str, id: &str) -> Option<StoreRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    /// Upserts of `record_id` fail with a store error.
    pub fn fail_record(&self, record_id: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(record_id.to_string());
        } else {
            set.remove(record_id);
        }
    }

    /// Only the next upsert of `record_id` fails.
    pub fn fail_next_upsert(&self, record_id: &str) {
        self.fail_once.lock().unwrap().insert(record_id.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn upserts(&self) -> Vec<StoreRecord> {
        self.upserts.lock().unwrap().clone()
    }

    fn check(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SyncError::StoreUnavailable("store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn modified_since(
        &self,
        table: &str,
        marker: &SyncMarker,
        limit: u32,
    ) -> SyncResult<Vec<StoreRecord>> {
        self.check()?;
        let mut found: Vec<StoreRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.table_name == table && marker.precedes(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (a.modified_at, &a.record_id).cmp(&(b.modified_at, &b.record_id))
        });
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn get(&self, table: &str, record_id: &str) -> SyncResult<Option<StoreRecord>> {
        self.check()?;
        Ok(self.record(table, record_id))
    }

    async fn upsert(&self, record: &StoreRecord) -> SyncResult<()> {
        self.check()?;
        if self.failing.lock().unwrap().contains(&record.record_id)
            || self.fail_once.lock().unwrap().remove(&record.record_id)
        {
            return Err(SyncError::StoreError(format!(
                "constraint failed for {}",
                record.record_id
            )));
        }
        self.insert(record.clone());
        self.upserts.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// =============================================================================
// Connectivity Probe
// =============================================================================

pub struct FakeProbe {
    network: AtomicBool,
    host: AtomicBool,
    data_path: AtomicBool,
    host_delay: Mutex<Duration>,
    last_target: Mutex<Option<String>>,
}

impl FakeProbe {
    fn with(up: bool) -> Self {
        FakeProbe {
            network: AtomicBool::new(up),
            host: AtomicBool::new(up),
            data_path: AtomicBool::new(up),
            host_delay: Mutex::new(Duration::from_millis(2)),
            last_target: Mutex::new(None),
        }
    }

    pub fn up() -> Self {
        Self::with(true)
    }

    pub fn down() -> Self {
        Self::with(false)
    }

    pub fn set_network(&self, up: bool) {
        self.network.store(up, Ordering::SeqCst);
    }

    pub fn set_host(&self, up: bool) {
        self.host.store(up, Ordering::SeqCst);
    }

    pub fn set_data_path(&self, up: bool) {
        self.data_path.store(up, Ordering::SeqCst);
    }

    pub fn set_host_delay(&self, delay: Duration) {
        *self.host_delay.lock().unwrap() = delay;
    }

    pub fn last_target(&self) -> Option<String> {
        self.last_target.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectivityProbe for FakeProbe {
    async fn network_available(&self, target: &str) -> SyncResult<()> {
        *self.last_target.lock().unwrap() = Some(target.to_string());
        if self.network.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NetworkUnavailable("no route".into()))
        }
    }

    async fn host_reachable(&self, target: &str) -> SyncResult<Duration> {
        let delay = *self.host_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.host.load(Ordering::SeqCst) {
            Ok(delay)
        } else {
            Err(SyncError::NetworkUnavailable(format!("{} refused", target)))
        }
    }

    async fn data_path_accessible(&self, path: &Path) -> SyncResult<()> {
        if self.data_path.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NetworkUnavailable(format!(
                "{} not mounted",
                path.display()
            )))
        }
    }
}

// =============================================================================
// Notifier / Hardware Sink
// =============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Notification) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|n| pred(n)).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.events.lock().unwrap().push(notification.clone());
    }
}

#[derive(Default)]
pub struct RecordingSink {
    dispatched: Mutex<Vec<HardwareJob>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn dispatched(&self) -> Vec<HardwareJob> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HardwareSink for RecordingSink {
    async fn dispatch(&self, job: &HardwareJob) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::HardwareDispatchFailed("printer offline".into()));
        }
        self.dispatched.lock().unwrap().push(job.clone());
        Ok(())
    }
}
