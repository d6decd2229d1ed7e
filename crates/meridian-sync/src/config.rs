//! # Resilience Configuration
//!
//! Configuration management for the resilience services.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     MERIDIAN_ROLE=authoritative                                        │
//! │     MERIDIAN_DATA_PATH=/mnt/pos-share                                  │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/pos/resilience.toml (Linux)                              │
//! │     ~/Library/Application Support/com.meridian.pos/resilience.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     satellite role, 30s heartbeat, 60s sync, 20%/10% thresholds        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # resilience.toml
//! [terminal]
//! name = "Register 2"
//! role = "satellite"
//! address = "192.168.1.22:5000"
//!
//! [authoritative]
//! address = "192.168.1.10:5000"
//! data_path = "/mnt/pos-share"
//!
//! [power]
//! source = "upsc"
//! ups_name = "ups@localhost"
//! low_threshold = 25
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use meridian_core::checkpoint::DEFAULT_CHECKPOINT_RETENTION_HOURS;
use meridian_core::conflict::DEFAULT_MAX_CLOCK_SKEW_SECS;
use meridian_core::journal::DEFAULT_MAX_RETRIES;
use meridian_core::power::{DEFAULT_CRITICAL_BATTERY_THRESHOLD, DEFAULT_LOW_BATTERY_THRESHOLD};
use meridian_core::validation::{validate_address, validate_table_name, validate_thresholds};
use meridian_core::{tables, PowerThresholds, TerminalRegistration, TerminalRole};

use crate::error::{SyncError, SyncResult};

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

// =============================================================================
// Power Source Selection
// =============================================================================

/// Which UPS integration the power monitor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSourceKind {
    /// Try NUT's `upsc`, then apcupsd's `apcaccess`.
    #[default]
    Auto,
    Upsc,
    Apcaccess,
    /// A settable reading, for demos.
    Simulated,
    /// No UPS: always reports not detected.
    None,
}

impl std::fmt::Display for PowerSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerSourceKind::Auto => write!(f, "auto"),
            PowerSourceKind::Upsc => write!(f, "upsc"),
            PowerSourceKind::Apcaccess => write!(f, "apcaccess"),
            PowerSourceKind::Simulated => write!(f, "simulated"),
            PowerSourceKind::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for PowerSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(PowerSourceKind::Auto),
            "upsc" | "nut" => Ok(PowerSourceKind::Upsc),
            "apcaccess" | "apcupsd" => Ok(PowerSourceKind::Apcaccess),
            "simulated" | "sim" => Ok(PowerSourceKind::Simulated),
            "none" | "off" => Ok(PowerSourceKind::None),
            other => Err(format!(
                "Unknown power source: '{}'. Valid options: auto, upsc, apcaccess, simulated, none",
                other
            )),
        }
    }
}

// =============================================================================
// Configuration Sections
// =============================================================================

/// Identity of this terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Assigned by the registry on first start when absent.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default = "default_terminal_name")]
    pub name: String,

    #[serde(default)]
    pub role: TerminalRole,

    /// Where other terminals reach this one (`host:port`).
    #[serde(default)]
    pub address: Option<String>,

    /// Derived from the machine id when absent.
    #[serde(default)]
    pub hardware_fingerprint: Option<String>,
}

/// How a satellite reaches the authoritative terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritativeSettings {
    /// `host:port`. Falls back to the registry's authoritative terminal.
    #[serde(default)]
    pub address: Option<String>,

    /// Shared folder holding the authoritative database.
    #[serde(default)]
    pub data_path: Option<PathBuf>,

    #[serde(default = "default_database_file")]
    pub database_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalSettings {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_sync_secs")]
    pub sync_secs: u64,

    #[serde(default = "default_power_secs")]
    pub power_secs: u64,

    /// Checkpoint and journal retention sweep.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,

    /// Extra wait after the power source errors.
    #[serde(default = "default_power_error_backoff_secs")]
    pub power_error_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_tracked_tables")]
    pub tracked_tables: Vec<String>,

    /// Records pulled per table per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Apply attempts before a journal entry is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive probe failures before a network alert is raised.
    #[serde(default = "default_network_alert_threshold")]
    pub network_alert_threshold: u32,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: i64,

    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSettings {
    #[serde(default)]
    pub source: PowerSourceKind,

    /// NUT device name passed to `upsc`.
    #[serde(default = "default_ups_name")]
    pub ups_name: String,

    #[serde(default = "default_low_threshold")]
    pub low_threshold: u8,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u8,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// How long finished checkpoints and applied journal entries are kept.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Local database file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Resilience Configuration
// =============================================================================

/// Complete configuration for one terminal's resilience services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub terminal: TerminalSettings,

    #[serde(default)]
    pub authoritative: AuthoritativeSettings,

    #[serde(default)]
    pub intervals: IntervalSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub power: PowerSettings,

    #[serde(default)]
    pub checkpoints: CheckpointSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_terminal_name() -> String {
    "POS Terminal".to_string()
}

fn default_database_file() -> String {
    "meridian.db".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_sync_secs() -> u64 {
    60
}

fn default_power_secs() -> u64 {
    30
}

fn default_sweep_secs() -> u64 {
    3600
}

fn default_power_error_backoff_secs() -> u64 {
    60
}

fn default_tracked_tables() -> Vec<String> {
    tables::ALL.iter().map(|t| t.to_string()).collect()
}

fn default_batch_size() -> u32 {
    500
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_network_alert_threshold() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_max_clock_skew_secs() -> i64 {
    DEFAULT_MAX_CLOCK_SKEW_SECS
}

fn default_max_conflict_retries() -> u32 {
    3
}

fn default_ups_name() -> String {
    "ups".to_string()
}

fn default_low_threshold() -> u8 {
    DEFAULT_LOW_BATTERY_THRESHOLD
}

fn default_critical_threshold() -> u8 {
    DEFAULT_CRITICAL_BATTERY_THRESHOLD
}

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_retention_hours() -> i64 {
    DEFAULT_CHECKPOINT_RETENTION_HOURS
}

impl Default for TerminalSettings {
    fn default() -> Self {
        TerminalSettings {
            id: None,
            name: default_terminal_name(),
            role: TerminalRole::default(),
            address: None,
            hardware_fingerprint: None,
        }
    }
}

impl Default for AuthoritativeSettings {
    fn default() -> Self {
        AuthoritativeSettings {
            address: None,
            data_path: None,
            database_file: default_database_file(),
        }
    }
}

impl Default for IntervalSettings {
    fn default() -> Self {
        IntervalSettings {
            heartbeat_secs: default_heartbeat_secs(),
            sync_secs: default_sync_secs(),
            power_secs: default_power_secs(),
            sweep_secs: default_sweep_secs(),
            power_error_backoff_secs: default_power_error_backoff_secs(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            tracked_tables: default_tracked_tables(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            network_alert_threshold: default_network_alert_threshold(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl Default for PowerSettings {
    fn default() -> Self {
        PowerSettings {
            source: PowerSourceKind::default(),
            ups_name: default_ups_name(),
            low_threshold: default_low_threshold(),
            critical_threshold: default_critical_threshold(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        CheckpointSettings {
            retention_hours: default_retention_hours(),
        }
    }
}

// =============================================================================
// Loading & Saving
// =============================================================================

impl ResilienceConfig {
    /// Loads configuration from file and environment.
    ///
    /// ## Loading Order
    /// 1. Start with defaults
    /// 2. Load from TOML file (if exists)
    /// 3. Override with environment variables
    /// 4. Validate
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading resilience config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load resilience config, using defaults");
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Resilience config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        validate_thresholds(self.thresholds())
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        let intervals = [
            ("heartbeat_secs", self.intervals.heartbeat_secs),
            ("sync_secs", self.intervals.sync_secs),
            ("power_secs", self.intervals.power_secs),
            ("sweep_secs", self.intervals.sweep_secs),
            ("probe_timeout_ms", self.sync.probe_timeout_ms),
            ("query_timeout_secs", self.power.query_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.sync.tracked_tables.is_empty() {
            return Err(SyncError::InvalidConfig(
                "tracked_tables must name at least one table".into(),
            ));
        }
        for table in &self.sync.tracked_tables {
            validate_table_name(table).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "max_retries must be greater than 0".into(),
            ));
        }

        if self.checkpoints.retention_hours <= 0 {
            return Err(SyncError::InvalidConfig(
                "retention_hours must be greater than 0".into(),
            ));
        }

        for address in [&self.terminal.address, &self.authoritative.address]
            .into_iter()
            .flatten()
        {
            validate_address(address).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        }

        if !self.is_authoritative()
            && self.authoritative.address.is_none()
            && self.authoritative.data_path.is_none()
        {
            return Err(SyncError::InvalidConfig(
                "a satellite terminal needs authoritative.address or authoritative.data_path".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("MERIDIAN_TERMINAL_ID") {
            debug!(terminal_id = %id, "Overriding terminal ID from environment");
            self.terminal.id = Some(id);
        }

        if let Ok(name) = std::env::var("MERIDIAN_TERMINAL_NAME") {
            self.terminal.name = name;
        }

        if let Ok(role) = std::env::var("MERIDIAN_ROLE") {
            match role.parse() {
                Ok(parsed) => {
                    debug!(role = %role, "Overriding terminal role from environment");
                    self.terminal.role = parsed;
                }
                Err(e) => warn!(error = %e, "Ignoring MERIDIAN_ROLE"),
            }
        }

        if let Ok(address) = std::env::var("MERIDIAN_TERMINAL_ADDRESS") {
            self.terminal.address = Some(address);
        }

        if let Ok(address) = std::env::var("MERIDIAN_AUTHORITATIVE_ADDRESS") {
            debug!(address = %address, "Overriding authoritative address from environment");
            self.authoritative.address = Some(address);
        }

        if let Ok(path) = std::env::var("MERIDIAN_DATA_PATH") {
            debug!(path = %path, "Overriding data path from environment");
            self.authoritative.data_path = Some(PathBuf::from(path));
        }

        if let Ok(source) = std::env::var("MERIDIAN_POWER_SOURCE") {
            match source.parse() {
                Ok(parsed) => self.power.source = parsed,
                Err(e) => warn!(error = %e, "Ignoring MERIDIAN_POWER_SOURCE"),
            }
        }

        if let Ok(path) = std::env::var("MERIDIAN_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "meridian", "pos")
            .map(|dirs| dirs.config_dir().join("resilience.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn is_authoritative(&self) -> bool {
        self.terminal.role.is_authoritative()
    }

    pub fn thresholds(&self) -> PowerThresholds {
        PowerThresholds {
            low: self.power.low_threshold,
            critical: self.power.critical_threshold,
        }
    }

    /// Local database file: configured, else the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "meridian", "pos")
                .map(|dirs| dirs.data_dir().join("meridian.db"))
                .unwrap_or_else(|| PathBuf::from("meridian.db"))
        })
    }

    /// The authoritative database file on the shared data path, if configured.
    pub fn authoritative_database_path(&self) -> Option<PathBuf> {
        self.authoritative
            .data_path
            .as_ref()
            .map(|dir| dir.join(&self.authoritative.database_file))
    }

    /// Configured fingerprint, else the machine id, else the host name.
    pub fn hardware_fingerprint(&self) -> String {
        if let Some(ref fingerprint) = self.terminal.hardware_fingerprint {
            return fingerprint.clone();
        }

        MACHINE_ID_PATHS
            .iter()
            .find_map(|path| read_trimmed(Path::new(path)))
            .or_else(|| read_trimmed(Path::new("/etc/hostname")))
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .unwrap_or_else(|| self.terminal.name.clone())
    }

    pub fn registration(&self, app_version: Option<&str>) -> TerminalRegistration {
        TerminalRegistration {
            terminal_id: self.terminal.id.clone(),
            display_name: self.terminal.name.clone(),
            role: self.terminal.role,
            address: self.terminal.address.clone(),
            hardware_fingerprint: self.hardware_fingerprint(),
            app_version: app_version.map(str::to_string),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.heartbeat_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.sync_secs)
    }

    pub fn power_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.power_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.sweep_secs)
    }

    pub fn power_error_backoff(&self) -> Duration {
        Duration::from_secs(self.intervals.power_error_backoff_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.probe_timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.checkpoints.retention_hours)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
