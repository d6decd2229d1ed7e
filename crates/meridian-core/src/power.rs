//! # Power Classification
//!
//! Turns raw UPS / battery readings into a power state, and state changes
//! into the events recorded in the power log.
//!
//! ## Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  reading unavailable / timed out ─────────────► NOT_DETECTED            │
//! │  percentage ≤ critical (10) ──────────────────► CRITICAL                │
//! │  percentage ≤ low (20) ───────────────────────► LOW_BATTERY             │
//! │  on mains ────────────────────────────────────► ONLINE                  │
//! │  otherwise ───────────────────────────────────► ON_BATTERY              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transition Events
//! ```text
//!   previous         current          event
//!   ─────────────    ─────────────    ─────────────────
//!   any              CRITICAL         battery_critical
//!   any              LOW_BATTERY      battery_low
//!   any              ON_BATTERY       power_cut
//!   none/NOT_DET.    ONLINE           ups_detected
//!   battery states   ONLINE           power_restored
//!   detected state   NOT_DETECTED     ups_disconnected
//!   same state       same state       (nothing)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub const DEFAULT_LOW_BATTERY_THRESHOLD: u8 = 20;
pub const DEFAULT_CRITICAL_BATTERY_THRESHOLD: u8 = 10;

// =============================================================================
// Power State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Online,
    OnBattery,
    LowBattery,
    Critical,
    NotDetected,
}

impl PowerState {
    /// States that put the terminal into safe mode.
    pub fn requires_safe_mode(&self) -> bool {
        matches!(self, PowerState::LowBattery | PowerState::Critical)
    }

    pub fn is_on_battery(&self) -> bool {
        matches!(
            self,
            PowerState::OnBattery | PowerState::LowBattery | PowerState::Critical
        )
    }

    pub fn health(&self) -> PowerHealth {
        match self {
            PowerState::Critical => PowerHealth::Critical,
            PowerState::LowBattery | PowerState::OnBattery => PowerHealth::Warning,
            PowerState::NotDetected => PowerHealth::Unknown,
            PowerState::Online => PowerHealth::Healthy,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::Online => "online",
            PowerState::OnBattery => "on_battery",
            PowerState::LowBattery => "low_battery",
            PowerState::Critical => "critical",
            PowerState::NotDetected => "not_detected",
        };
        f.write_str(s)
    }
}

/// Coarse health for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PowerHealth {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

// =============================================================================
// Readings
// =============================================================================

/// What a power source reports.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PowerReading {
    /// Battery charge, 0-100.
    pub percentage: Option<f32>,
    pub estimated_runtime_minutes: Option<u32>,
    pub is_on_mains: bool,
    pub model: Option<String>,
    pub input_voltage: Option<f32>,
}

/// Battery thresholds in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerThresholds {
    pub low: u8,
    pub critical: u8,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        PowerThresholds {
            low: DEFAULT_LOW_BATTERY_THRESHOLD,
            critical: DEFAULT_CRITICAL_BATTERY_THRESHOLD,
        }
    }
}

/// Classifies a reading. `None` means the source could not be queried.
pub fn classify(reading: Option<&PowerReading>, thresholds: PowerThresholds) -> PowerState {
    let Some(reading) = reading else {
        return PowerState::NotDetected;
    };

    if let Some(pct) = reading.percentage {
        if pct <= f32::from(thresholds.critical) {
            return PowerState::Critical;
        }
        if pct <= f32::from(thresholds.low) {
            return PowerState::LowBattery;
        }
    }

    if reading.is_on_mains {
        PowerState::Online
    } else {
        PowerState::OnBattery
    }
}

/// Latest classified observation, broadcast to interested tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PowerSnapshot {
    pub state: PowerState,
    pub reading: Option<PowerReading>,
    #[ts(as = "String")]
    pub observed_at: DateTime<Utc>,
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PowerEventType {
    PowerCut,
    PowerRestored,
    BatteryLow,
    BatteryCritical,
    UpsDetected,
    UpsDisconnected,
}

impl std::fmt::Display for PowerEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerEventType::PowerCut => "power_cut",
            PowerEventType::PowerRestored => "power_restored",
            PowerEventType::BatteryLow => "battery_low",
            PowerEventType::BatteryCritical => "battery_critical",
            PowerEventType::UpsDetected => "ups_detected",
            PowerEventType::UpsDisconnected => "ups_disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// No in-flight transactions were left behind.
    Successful,
    /// Checkpoints are waiting to be resumed or discarded.
    Pending,
}

/// Event to log when the classification moves from `previous` to `current`.
pub fn transition_event(previous: Option<PowerState>, current: PowerState) -> Option<PowerEventType> {
    if previous == Some(current) {
        return None;
    }

    match current {
        PowerState::Critical => Some(PowerEventType::BatteryCritical),
        PowerState::LowBattery => Some(PowerEventType::BatteryLow),
        PowerState::OnBattery => Some(PowerEventType::PowerCut),
        PowerState::Online => match previous {
            None | Some(PowerState::NotDetected) => Some(PowerEventType::UpsDetected),
            Some(_) => Some(PowerEventType::PowerRestored),
        },
        PowerState::NotDetected => match previous {
            None => None,
            Some(_) => Some(PowerEventType::UpsDisconnected),
        },
    }
}

/// A row of the append-only power log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PowerEvent {
    pub id: i64,
    pub terminal_id: String,
    pub event_type: PowerEventType,
    pub power_state: PowerState,
    pub battery_level: Option<f32>,
    pub estimated_runtime_minutes: Option<i64>,
    pub affected_transactions: i64,
    pub recovery_status: Option<RecoveryStatus>,
    pub notes: Option<String>,
    #[ts(as = "String")]
    pub occurred_at: DateTime<Utc>,
}

/// A power event about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPowerEvent {
    pub terminal_id: String,
    pub event_type: PowerEventType,
    pub power_state: PowerState,
    pub battery_level: Option<f32>,
    pub estimated_runtime_minutes: Option<i64>,
    pub affected_transactions: i64,
    pub recovery_status: Option<RecoveryStatus>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(pct: Option<f32>, mains: bool) -> PowerReading {
        PowerReading {
            percentage: pct,
            is_on_mains: mains,
            ..Default::default()
        }
    }

    #[test]
    fn test_classification_thresholds() {
        let t = PowerThresholds::default();

        assert_eq!(classify(None, t), PowerState::NotDetected);
        assert_eq!(classify(Some(&reading(Some(100.0), true)), t), PowerState::Online);
        assert_eq!(classify(Some(&reading(Some(80.0), false)), t), PowerState::OnBattery);
        assert_eq!(classify(Some(&reading(Some(20.0), false)), t), PowerState::LowBattery);
        assert_eq!(classify(Some(&reading(Some(15.0), false)), t), PowerState::LowBattery);
        assert_eq!(classify(Some(&reading(Some(10.0), false)), t), PowerState::Critical);
        assert_eq!(classify(Some(&reading(Some(3.0), true)), t), PowerState::Critical);
    }

    #[test]
    fn test_unknown_percentage_uses_mains_flag() {
        let t = PowerThresholds::default();
        assert_eq!(classify(Some(&reading(None, true)), t), PowerState::Online);
        assert_eq!(classify(Some(&reading(None, false)), t), PowerState::OnBattery);
    }

    #[test]
    fn test_custom_thresholds() {
        let t = PowerThresholds { low: 40, critical: 25 };
        assert_eq!(classify(Some(&reading(Some(35.0), false)), t), PowerState::LowBattery);
        assert_eq!(classify(Some(&reading(Some(25.0), false)), t), PowerState::Critical);
    }

    #[test]
    fn test_transition_events() {
        use PowerEventType::*;
        use PowerState::*;

        assert_eq!(transition_event(Some(Online), Online), None);
        assert_eq!(transition_event(None, NotDetected), None);
        assert_eq!(transition_event(None, Online), Some(UpsDetected));
        assert_eq!(transition_event(Some(NotDetected), Online), Some(UpsDetected));
        assert_eq!(transition_event(Some(Online), OnBattery), Some(PowerCut));
        assert_eq!(transition_event(Some(OnBattery), LowBattery), Some(BatteryLow));
        assert_eq!(transition_event(Some(LowBattery), Critical), Some(BatteryCritical));
        assert_eq!(transition_event(Some(Critical), Online), Some(PowerRestored));
        assert_eq!(transition_event(Some(Online), NotDetected), Some(UpsDisconnected));
    }

    #[test]
    fn test_safe_mode_states_and_health() {
        assert!(PowerState::LowBattery.requires_safe_mode());
        assert!(PowerState::Critical.requires_safe_mode());
        assert!(!PowerState::OnBattery.requires_safe_mode());
        assert!(!PowerState::NotDetected.requires_safe_mode());

        assert_eq!(PowerState::Critical.health(), PowerHealth::Critical);
        assert_eq!(PowerState::OnBattery.health(), PowerHealth::Warning);
        assert_eq!(PowerState::NotDetected.health(), PowerHealth::Unknown);
        assert_eq!(PowerState::Online.health(), PowerHealth::Healthy);
    }
}
