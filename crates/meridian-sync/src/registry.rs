//! # Terminal Registry
//!
//! Identity, role and liveness of every terminal in the deployment.
//!
//! ## Registration Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  register(registration)                                                 │
//! │                                                                         │
//! │  fingerprint already active? ──yes──► refresh name/address/version,    │
//! │            │                          return the existing id            │
//! │            no                                                           │
//! │            ▼                                                            │
//! │  requested id taken? ─────────yes──► RegistrationConflict              │
//! │            │                                                            │
//! │            no                                                           │
//! │            ▼                                                            │
//! │  authoritative role while another ──yes──► AuthoritativeConflict       │
//! │  authoritative terminal is active?                                      │
//! │            │                                                            │
//! │            no                                                           │
//! │            ▼                                                            │
//! │  insert (TERM-XXXXXXXX when no id was requested)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use meridian_core::terminal::generate_terminal_id;
use meridian_core::validation::validate_registration;
use meridian_core::{SyncStatus, Terminal, TerminalRegistration, TerminalStatus, TerminalSummary};
use meridian_db::{Database, DbError, TerminalRepository};

use crate::error::{SyncError, SyncResult};

/// Registry of terminals, backed by the `terminals` table.
#[derive(Debug, Clone)]
pub struct TerminalRegistry {
    terminals: TerminalRepository,
}

impl TerminalRegistry {
    pub fn new(db: &Database) -> Self {
        TerminalRegistry {
            terminals: db.terminals(),
        }
    }

    /// Registers a terminal and returns its id.
    pub async fn register(&self, registration: TerminalRegistration) -> SyncResult<String> {
        validate_registration(&registration)?;
        let now = Utc::now();

        if let Some(existing) = self
            .terminals
            .find_active_by_fingerprint(&registration.hardware_fingerprint)
            .await?
        {
            if let Some(ref requested) = registration.terminal_id {
                if requested != &existing.terminal_id {
                    debug!(
                        requested = %requested,
                        existing = %existing.terminal_id,
                        "Fingerprint already registered, keeping existing id"
                    );
                }
            }

            if registration.role != existing.role {
                if registration.role.is_authoritative() {
                    self.ensure_no_other_authoritative(&existing.terminal_id).await?;
                } else {
                    // Two roles only: existing is authoritative here
                    warn!(terminal_id = %existing.terminal_id, "Demotion of the authoritative terminal rejected");
                    return Err(SyncError::RegistrationConflict {
                        terminal_id: existing.terminal_id,
                        reason: "the authoritative terminal cannot re-register as a satellite".into(),
                    });
                }
            }

            self.terminals
                .update_registration(&existing.terminal_id, &registration, now)
                .await?;
            info!(terminal_id = %existing.terminal_id, "Terminal re-registered");
            return Ok(existing.terminal_id);
        }

        let terminal_id = match registration.terminal_id {
            Some(ref id) => {
                if let Some(taken) = self.terminals.get(id).await? {
                    let reason = if taken.is_active() {
                        "id is registered to a different hardware fingerprint"
                    } else {
                        "id belongs to a decommissioned terminal"
                    };
                    warn!(terminal_id = %id, reason, "Registration rejected");
                    return Err(SyncError::RegistrationConflict {
                        terminal_id: id.clone(),
                        reason: reason.to_string(),
                    });
                }
                id.clone()
            }
            None => generate_terminal_id(),
        };

        if registration.role.is_authoritative() {
            self.ensure_no_other_authoritative(&terminal_id).await?;
        }

        let terminal = Terminal {
            terminal_id: terminal_id.clone(),
            display_name: registration.display_name.trim().to_string(),
            role: registration.role,
            address: registration.address.clone(),
            hardware_fingerprint: registration.hardware_fingerprint.clone(),
            app_version: registration.app_version.clone(),
            status: TerminalStatus::Online,
            last_seen_at: Some(now),
            last_heartbeat_at: Some(now),
            pending_journal_count: 0,
            last_sync_at: None,
            sync_status: SyncStatus::Pending,
            decommissioned_at: None,
            created_at: now,
            updated_at: now,
        };

        match self.terminals.insert(&terminal).await {
            Ok(()) => {}
            // Lost a race with a concurrent registration
            Err(DbError::UniqueViolation { field, .. }) => {
                return Err(SyncError::RegistrationConflict {
                    terminal_id,
                    reason: format!("duplicate {}", field),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(terminal_id = %terminal_id, role = %terminal.role, "Terminal registered");
        Ok(terminal_id)
    }

    async fn ensure_no_other_authoritative(&self, terminal_id: &str) -> SyncResult<()> {
        match self.terminals.find_authoritative().await? {
            Some(current) if current.terminal_id != terminal_id => {
                warn!(
                    terminal_id = %terminal_id,
                    existing = %current.terminal_id,
                    "Second authoritative terminal rejected"
                );
                Err(SyncError::AuthoritativeConflict {
                    existing: current.terminal_id,
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn heartbeat(&self, terminal_id: &str) -> SyncResult<()> {
        self.touch(terminal_id, TerminalStatus::Online).await
    }

    /// Heartbeat that reports the terminal as degraded (safe mode).
    pub async fn mark_degraded(&self, terminal_id: &str) -> SyncResult<()> {
        self.touch(terminal_id, TerminalStatus::Degraded).await
    }

    async fn touch(&self, terminal_id: &str, status: TerminalStatus) -> SyncResult<()> {
        if self.terminals.heartbeat(terminal_id, status, Utc::now()).await? {
            Ok(())
        } else {
            Err(SyncError::TerminalNotFound(terminal_id.to_string()))
        }
    }

    pub async fn mark_offline(&self, terminal_id: &str) -> SyncResult<()> {
        if self.terminals.mark_offline(terminal_id, Utc::now()).await? {
            debug!(terminal_id = %terminal_id, "Terminal marked offline");
            Ok(())
        } else {
            Err(SyncError::TerminalNotFound(terminal_id.to_string()))
        }
    }

    /// Records the outcome of a sync cycle.
    pub async fn record_sync(
        &self,
        terminal_id: &str,
        sync_status: SyncStatus,
        pending_journal_count: i64,
    ) -> SyncResult<()> {
        let updated = self
            .terminals
            .record_sync(terminal_id, sync_status, pending_journal_count, Utc::now())
            .await?;
        if updated {
            Ok(())
        } else {
            Err(SyncError::TerminalNotFound(terminal_id.to_string()))
        }
    }

    /// Soft-removes a terminal. The authoritative terminal can't be removed.
    pub async fn decommission(&self, terminal_id: &str) -> SyncResult<()> {
        let terminal = self
            .terminals
            .get(terminal_id)
            .await?
            .filter(Terminal::is_active)
            .ok_or_else(|| SyncError::TerminalNotFound(terminal_id.to_string()))?;

        if terminal.role.is_authoritative() {
            return Err(SyncError::RegistrationConflict {
                terminal_id: terminal_id.to_string(),
                reason: "the authoritative terminal cannot be decommissioned".into(),
            });
        }

        self.terminals.decommission(terminal_id, Utc::now()).await?;
        info!(terminal_id = %terminal_id, "Terminal decommissioned");
        Ok(())
    }

    pub async fn get(&self, terminal_id: &str) -> SyncResult<Option<Terminal>> {
        Ok(self.terminals.get(terminal_id).await?)
    }

    /// Active terminals, authoritative first.
    pub async fn list(&self) -> SyncResult<Vec<TerminalSummary>> {
        let now = Utc::now();
        Ok(self
            .terminals
            .list_active()
            .await?
            .iter()
            .map(|t| t.summary(now))
            .collect())
    }

    pub async fn authoritative(&self) -> SyncResult<Option<Terminal>> {
        Ok(self.terminals.find_authoritative().await?)
    }

    /// Marks terminals offline whose last heartbeat is older than `timeout`.
    /// `keep` (the caller) is never swept.
    pub async fn sweep_stale(&self, keep: &str, timeout: Duration) -> SyncResult<Vec<String>> {
        let now = Utc::now();
        let swept = self
            .terminals
            .mark_stale_offline(now - timeout, keep, now)
            .await?;
        if !swept.is_empty() {
            info!(count = swept.len(), terminals = ?swept, "Stale terminals marked offline");
        }
        Ok(swept)
    }
}
