//! # Power Monitor
//!
//! Polls the UPS, classifies the reading and logs every change.
//!
//! ## Poll
//! ```text
//! ┌──────────────┐  read (bounded)  ┌──────────────┐  classify  ┌──────────────┐
//! │ PowerSource  │ ───────────────► │ PowerReading │ ─────────► │ PowerState   │
//! │ upsc /       │  timeout/error   │   or None    │            └──────┬───────┘
//! │ apcaccess    │ ──► None         └──────────────┘                   │
//! └──────────────┘                                                     ▼
//!                                   state changed? ──► power_events (append)
//!                                   always        ──► watch<PowerSnapshot>
//! ```
//!
//! The safe mode reactor subscribes to the watch channel; the monitor never
//! touches safe mode itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use meridian_core::power::{classify, transition_event};
use meridian_core::{
    NewPowerEvent, PowerEvent, PowerEventType, PowerHealth, PowerReading, PowerSnapshot,
    PowerState, PowerThresholds, RecoveryStatus,
};
use meridian_db::{Database, PowerEventRepository, TransactionCheckpointRepository};

use crate::config::{PowerSettings, PowerSourceKind};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Power Sources
// =============================================================================

/// Something that can report the battery state.
#[async_trait]
pub trait PowerSource: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means no UPS is attached.
    async fn read(&self) -> SyncResult<Option<PowerReading>>;
}

/// Runs a status tool. A missing binary means no UPS tooling is installed.
async fn run_tool(program: &str, args: &[&str]) -> SyncResult<Option<String>> {
    let output = match Command::new(program).args(args).kill_on_drop(true).output().await {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(program, "Power tool not installed");
            return Ok(None);
        }
        Err(e) => {
            return Err(SyncError::PowerSourceFailed(format!("{}: {}", program, e)));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::PowerSourceFailed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}

/// Leading number of a value such as `230.0 Volts`.
fn leading_number(value: &str) -> Option<f32> {
    value.split_whitespace().next()?.parse().ok()
}

/// Parses `upsc <ups>` output (`key: value` lines).
pub fn parse_upsc(output: &str) -> Option<PowerReading> {
    let mut reading = PowerReading::default();
    let mut status = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "battery.charge" => reading.percentage = leading_number(value),
            "battery.runtime" => {
                reading.estimated_runtime_minutes =
                    leading_number(value).map(|secs| (secs / 60.0).round() as u32)
            }
            "input.voltage" => reading.input_voltage = leading_number(value),
            "ups.model" => reading.model = Some(value.to_string()),
            "ups.status" => status = Some(value.to_string()),
            _ => {}
        }
    }

    let status = status?;
    let flags: Vec<&str> = status.split_whitespace().collect();
    reading.is_on_mains = flags.contains(&"OL") && !flags.contains(&"OB");
    Some(reading)
}

/// Parses `apcaccess` output (`KEY      : value` lines).
pub fn parse_apcaccess(output: &str) -> Option<PowerReading> {
    let mut reading = PowerReading::default();
    let mut status = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "BCHARGE" => reading.percentage = leading_number(value),
            "TIMELEFT" => {
                reading.estimated_runtime_minutes =
                    leading_number(value).map(|mins| mins.round() as u32)
            }
            "LINEV" => reading.input_voltage = leading_number(value),
            "MODEL" => reading.model = Some(value.to_string()),
            "STATUS" => status = Some(value.to_string()),
            _ => {}
        }
    }

    let status = status?;
    reading.is_on_mains = status.contains("ONLINE") && !status.contains("ONBATT");
    Some(reading)
}

/// Network UPS Tools.
pub struct UpscSource {
    ups_name: String,
}

impl UpscSource {
    pub fn new(ups_name: impl Into<String>) -> Self {
        UpscSource {
            ups_name: ups_name.into(),
        }
    }
}

#[async_trait]
impl PowerSource for UpscSource {
    fn name(&self) -> &str {
        "upsc"
    }

    async fn read(&self) -> SyncResult<Option<PowerReading>> {
        let Some(output) = run_tool("upsc", &[&self.ups_name]).await? else {
            return Ok(None);
        };
        Ok(parse_upsc(&output))
    }
}

/// apcupsd.
pub struct ApcAccessSource;

#[async_trait]
impl PowerSource for ApcAccessSource {
    fn name(&self) -> &str {
        "apcaccess"
    }

    async fn read(&self) -> SyncResult<Option<PowerReading>> {
        let Some(output) = run_tool("apcaccess", &[]).await? else {
            return Ok(None);
        };
        Ok(parse_apcaccess(&output))
    }
}

/// upsc first, then apcaccess.
pub struct AutoSource {
    upsc: UpscSource,
    apc: ApcAccessSource,
}

impl AutoSource {
    pub fn new(ups_name: impl Into<String>) -> Self {
        AutoSource {
            upsc: UpscSource::new(ups_name),
            apc: ApcAccessSource,
        }
    }
}

#[async_trait]
impl PowerSource for AutoSource {
    fn name(&self) -> &str {
        "auto"
    }

    async fn read(&self) -> SyncResult<Option<PowerReading>> {
        match self.upsc.read().await {
            Ok(Some(reading)) => return Ok(Some(reading)),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "upsc failed, trying apcaccess"),
        }
        self.apc.read().await
    }
}

/// A settable reading for demos and tests.
pub struct SimulatedSource {
    reading: watch::Sender<Option<PowerReading>>,
    failing: std::sync::atomic::AtomicBool,
    delay: Option<Duration>,
}

impl SimulatedSource {
    pub fn new(initial: Option<PowerReading>) -> Self {
        let (reading, _) = watch::channel(initial);
        SimulatedSource {
            reading,
            failing: std::sync::atomic::AtomicBool::new(false),
            delay: None,
        }
    }

    /// A UPS on mains at full charge.
    pub fn on_mains() -> Self {
        Self::new(Some(PowerReading {
            percentage: Some(100.0),
            is_on_mains: true,
            model: Some("Simulated UPS".into()),
            ..Default::default()
        }))
    }

    /// Makes every read take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set(&self, reading: Option<PowerReading>) {
        self.reading.send_replace(reading);
    }

    /// Sets the battery level and mains flag, keeping the other fields.
    pub fn set_battery(&self, percentage: f32, is_on_mains: bool) {
        self.reading.send_modify(|current| {
            let reading = current.get_or_insert_with(PowerReading::default);
            reading.percentage = Some(percentage);
            reading.is_on_mains = is_on_mains;
        });
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl PowerSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn read(&self) -> SyncResult<Option<PowerReading>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::PowerSourceFailed("simulated failure".into()));
        }
        Ok(self.reading.borrow().clone())
    }
}

/// For terminals without a UPS.
pub struct NoPowerSource;

#[async_trait]
impl PowerSource for NoPowerSource {
    fn name(&self) -> &str {
        "none"
    }

    async fn read(&self) -> SyncResult<Option<PowerReading>> {
        Ok(None)
    }
}

pub fn source_from_settings(settings: &PowerSettings) -> Arc<dyn PowerSource> {
    match settings.source {
        PowerSourceKind::Auto => Arc::new(AutoSource::new(settings.ups_name.clone())),
        PowerSourceKind::Upsc => Arc::new(UpscSource::new(settings.ups_name.clone())),
        PowerSourceKind::Apcaccess => Arc::new(ApcAccessSource),
        PowerSourceKind::Simulated => Arc::new(SimulatedSource::on_mains()),
        PowerSourceKind::None => Arc::new(NoPowerSource),
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct PowerPoll {
    pub snapshot: PowerSnapshot,
    /// Set when the classification changed.
    pub event: Option<PowerEventType>,
    /// Set when the source failed or timed out.
    pub source_error: Option<String>,
}

pub struct PowerMonitor {
    terminal_id: String,
    source: Arc<dyn PowerSource>,
    thresholds: PowerThresholds,
    query_timeout: Duration,
    events: PowerEventRepository,
    checkpoints: TransactionCheckpointRepository,
    snapshot: watch::Sender<Option<PowerSnapshot>>,
    /// Last classification, serializing polls.
    previous: Mutex<Option<PowerState>>,
}

impl PowerMonitor {
    pub fn new(
        terminal_id: impl Into<String>,
        db: &Database,
        source: Arc<dyn PowerSource>,
        thresholds: PowerThresholds,
        query_timeout: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        PowerMonitor {
            terminal_id: terminal_id.into(),
            source,
            thresholds,
            query_timeout,
            events: db.power_events(),
            checkpoints: db.transaction_checkpoints(),
            snapshot,
            previous: Mutex::new(None),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Reads the source once and records a transition if there was one.
    pub async fn poll(&self) -> SyncResult<PowerPoll> {
        let (reading, source_error) =
            match tokio::time::timeout(self.query_timeout, self.source.read()).await {
                Ok(Ok(reading)) => (reading, None),
                Ok(Err(e)) => {
                    warn!(source = self.source.name(), error = %e, "Power source query failed");
                    (None, Some(e.to_string()))
                }
                Err(_) => {
                    let e = SyncError::PowerQueryTimeout(self.query_timeout.as_secs());
                    warn!(source = self.source.name(), error = %e, "Power source query timed out");
                    (None, Some(e.to_string()))
                }
            };

        let state = classify(reading.as_ref(), self.thresholds);
        let now = Utc::now();

        let mut previous = self.previous.lock().await;
        let event_type = transition_event(*previous, state);

        if let Some(event_type) = event_type {
            // The snapshot is published even when the event write fails
            if let Err(e) = self
                .record_transition(event_type, state, reading.as_ref(), now)
                .await
            {
                error!(event = %event_type, power_state = %state, error = %e, "Could not record power event");
            }

            if state.is_on_battery() || state == PowerState::NotDetected {
                warn!(event = %event_type, power_state = %state, "Power state changed");
            } else {
                info!(event = %event_type, power_state = %state, "Power state changed");
            }
        }
        *previous = Some(state);
        drop(previous);

        let snapshot = PowerSnapshot {
            state,
            reading,
            observed_at: now,
        };
        self.snapshot.send_replace(Some(snapshot.clone()));

        Ok(PowerPoll {
            snapshot,
            event: event_type,
            source_error,
        })
    }

    async fn record_transition(
        &self,
        event_type: PowerEventType,
        state: PowerState,
        reading: Option<&PowerReading>,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let affected = self.checkpoints.count_active(&self.terminal_id).await?;
        let recovery_status = match event_type {
            PowerEventType::PowerRestored if affected == 0 => Some(RecoveryStatus::Successful),
            PowerEventType::PowerRestored => Some(RecoveryStatus::Pending),
            _ => None,
        };

        self.events
            .append(&NewPowerEvent {
                terminal_id: self.terminal_id.clone(),
                event_type,
                power_state: state,
                battery_level: reading.and_then(|r| r.percentage),
                estimated_runtime_minutes: reading
                    .and_then(|r| r.estimated_runtime_minutes)
                    .map(i64::from),
                affected_transactions: affected,
                recovery_status,
                notes: Some(format!("source: {}", self.source.name())),
                occurred_at: now,
            })
            .await?;
        debug!(event = %event_type, affected, "Power event recorded");
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PowerSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn current(&self) -> Option<PowerSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn health(&self) -> PowerHealth {
        self.current()
            .map(|s| s.state.health())
            .unwrap_or(PowerHealth::Unknown)
    }

    pub async fn recent_events(
        &self,
        limit: u32,
        event_type: Option<PowerEventType>,
    ) -> SyncResult<Vec<PowerEvent>> {
        Ok(self
            .events
            .recent(&self.terminal_id, event_type, limit)
            .await?)
    }
}
