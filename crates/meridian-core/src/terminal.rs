//! # Terminal Types
//!
//! Identity and health of every POS workstation in a deployment.
//!
//! ## Roles
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Store LAN                                       │
//! │                                                                         │
//! │   ┌──────────────────┐        ┌──────────────────┐                     │
//! │   │  TERM-1A2B3C4D   │        │  TERM-5E6F7A8B   │                     │
//! │   │  AUTHORITATIVE   │◄───────│    SATELLITE     │  journal drain      │
//! │   │  store of record │───────►│  offline capable │  + delta pull       │
//! │   └──────────────────┘        └──────────────────┘                     │
//! │            ▲                                                            │
//! │            │                  ┌──────────────────┐                     │
//! │            └──────────────────│    SATELLITE     │                     │
//! │                               └──────────────────┘                     │
//! │                                                                         │
//! │  Exactly one AUTHORITATIVE terminal per deployment.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Prefix of generated terminal identifiers.
pub const TERMINAL_ID_PREFIX: &str = "TERM-";

// =============================================================================
// Enums
// =============================================================================

/// Role of a terminal in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TerminalRole {
    /// Holds the canonical store of record.
    Authoritative,
    /// Operates offline and reconciles with the authoritative terminal.
    #[default]
    Satellite,
}

impl TerminalRole {
    pub fn is_authoritative(&self) -> bool {
        matches!(self, TerminalRole::Authoritative)
    }
}

impl std::fmt::Display for TerminalRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalRole::Authoritative => write!(f, "authoritative"),
            TerminalRole::Satellite => write!(f, "satellite"),
        }
    }
}

impl std::str::FromStr for TerminalRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "authoritative" | "main" | "primary" => Ok(TerminalRole::Authoritative),
            "satellite" | "secondary" => Ok(TerminalRole::Satellite),
            other => Err(format!(
                "Unknown terminal role: '{}'. Valid options: authoritative, satellite",
                other
            )),
        }
    }
}

/// Liveness of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Online,
    #[default]
    Offline,
    /// Alive but running in safe mode.
    Degraded,
}

/// Outcome of the most recent sync cycle for a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    #[default]
    Pending,
    Failed,
    /// Last cycle left at least one conflict unresolved.
    Conflict,
}

// =============================================================================
// Terminal
// =============================================================================

/// A registered terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Terminal {
    pub terminal_id: String,
    pub display_name: String,
    pub role: TerminalRole,
    /// `host:port` the terminal can be reached at.
    pub address: Option<String>,
    pub hardware_fingerprint: String,
    pub app_version: Option<String>,
    pub status: TerminalStatus,
    #[ts(as = "Option<String>")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub pending_journal_count: i64,
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    #[ts(as = "Option<String>")]
    pub decommissioned_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Terminal {
    /// True when the last cycle did not complete cleanly or work is queued.
    pub fn needs_sync(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Pending | SyncStatus::Failed)
            || self.pending_journal_count > 0
    }

    pub fn is_active(&self) -> bool {
        self.decommissioned_at.is_none()
    }

    /// Human-readable liveness, e.g. `online` or `last seen 5m ago`.
    pub fn uptime(&self, now: DateTime<Utc>) -> String {
        if self.status == TerminalStatus::Online {
            return "online".to_string();
        }

        match self.last_seen_at {
            None => "never".to_string(),
            Some(seen) => {
                let elapsed = now.signed_duration_since(seen).max(Duration::zero());
                if elapsed < Duration::hours(1) {
                    format!("last seen {}m ago", elapsed.num_minutes())
                } else if elapsed < Duration::days(1) {
                    format!("last seen {}h ago", elapsed.num_hours())
                } else {
                    format!("last seen {}d ago", elapsed.num_days())
                }
            }
        }
    }

    /// Projects the terminal into its diagnostics summary.
    pub fn summary(&self, now: DateTime<Utc>) -> TerminalSummary {
        TerminalSummary {
            terminal_id: self.terminal_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            address: self.address.clone(),
            status: self.status,
            sync_status: self.sync_status,
            pending_journal_count: self.pending_journal_count,
            last_heartbeat_at: self.last_heartbeat_at,
            last_sync_at: self.last_sync_at,
            needs_sync: self.needs_sync(),
            uptime: self.uptime(now),
        }
    }
}

/// Terminal row as shown by the diagnostics endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TerminalSummary {
    pub terminal_id: String,
    pub display_name: String,
    pub role: TerminalRole,
    pub address: Option<String>,
    pub status: TerminalStatus,
    pub sync_status: SyncStatus,
    pub pending_journal_count: i64,
    #[ts(as = "Option<String>")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub needs_sync: bool,
    pub uptime: String,
}

/// What a terminal presents when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalRegistration {
    /// Previously assigned id, if this terminal has registered before.
    pub terminal_id: Option<String>,
    pub display_name: String,
    pub role: TerminalRole,
    pub address: Option<String>,
    pub hardware_fingerprint: String,
    pub app_version: Option<String>,
}

/// Generates a new terminal id in the `TERM-XXXXXXXX` format.
pub fn generate_terminal_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", TERMINAL_ID_PREFIX, hex[..8].to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminal(status: TerminalStatus, last_seen: Option<DateTime<Utc>>) -> Terminal {
        let now = Utc::now();
        Terminal {
            terminal_id: "TERM-00000001".into(),
            display_name: "Register 1".into(),
            role: TerminalRole::Satellite,
            address: Some("192.168.1.20:5000".into()),
            hardware_fingerprint: "fp-1".into(),
            app_version: None,
            status,
            last_seen_at: last_seen,
            last_heartbeat_at: last_seen,
            pending_journal_count: 0,
            last_sync_at: None,
            sync_status: SyncStatus::Synced,
            decommissioned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_generated_id_format() {
        let id = generate_terminal_id();
        assert!(id.starts_with("TERM-"));
        assert_eq!(id.len(), 13);
        assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_needs_sync() {
        let mut t = terminal(TerminalStatus::Online, Some(Utc::now()));
        assert!(!t.needs_sync());

        t.pending_journal_count = 2;
        assert!(t.needs_sync());

        t.pending_journal_count = 0;
        t.sync_status = SyncStatus::Failed;
        assert!(t.needs_sync());

        // Conflicts are surfaced separately, not as "needs sync"
        t.sync_status = SyncStatus::Conflict;
        assert!(!t.needs_sync());
    }

    #[test]
    fn test_uptime_descriptions() {
        let now = Utc::now();
        assert_eq!(terminal(TerminalStatus::Online, Some(now)).uptime(now), "online");
        assert_eq!(terminal(TerminalStatus::Offline, None).uptime(now), "never");
        assert_eq!(
            terminal(TerminalStatus::Offline, Some(now - Duration::minutes(5))).uptime(now),
            "last seen 5m ago"
        );
        assert_eq!(
            terminal(TerminalStatus::Offline, Some(now - Duration::hours(3))).uptime(now),
            "last seen 3h ago"
        );
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("main".parse::<TerminalRole>().unwrap(), TerminalRole::Authoritative);
        assert_eq!("Satellite".parse::<TerminalRole>().unwrap(), TerminalRole::Satellite);
        assert!("hub".parse::<TerminalRole>().is_err());
    }
}
