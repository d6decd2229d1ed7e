//! Notification hook for events an operator should hear about.
//!
//! The services call [`Notifier::notify`] synchronously from their loops, so
//! implementations must return quickly (hand off to a channel if delivery
//! is slow).

use meridian_core::{ConflictState, PowerState, Winner};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A conflict was detected and written to the audit log.
    ConflictRecorded {
        table: String,
        record_id: String,
        winner: Option<Winner>,
        state: ConflictState,
    },
    /// A conflict exhausted its automatic retries and needs manual review.
    ConflictUnresolved {
        table: String,
        record_id: String,
        reason: String,
    },
    /// Interrupted transactions were found at startup.
    RecoveryPending { count: usize },
    NetworkUnavailable {
        consecutive_failures: u32,
        message: String,
    },
    SafeModeEntered { power_state: PowerState },
    SafeModeExited { flushed_jobs: usize },
    /// A journal entry will not be retried again.
    DeadLettered { seq: i64, reason: String },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Drops every notification.
pub struct NoOpNotifier;

impl Notifier for NoOpNotifier {
    fn notify(&self, _notification: &Notification) {}
}

/// Writes notifications to the log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::ConflictRecorded {
                table,
                record_id,
                winner,
                state,
            } => info!(%table, %record_id, ?winner, ?state, "Conflict recorded"),
            Notification::ConflictUnresolved {
                table,
                record_id,
                reason,
            } => warn!(%table, %record_id, %reason, "Conflict needs manual review"),
            Notification::RecoveryPending { count } => {
                warn!(count, "Interrupted transactions awaiting recovery")
            }
            Notification::NetworkUnavailable {
                consecutive_failures,
                message,
            } => warn!(consecutive_failures, %message, "Authoritative terminal unreachable"),
            Notification::SafeModeEntered { power_state } => {
                warn!(%power_state, "Safe mode entered")
            }
            Notification::SafeModeExited { flushed_jobs } => {
                info!(flushed_jobs, "Safe mode exited")
            }
            Notification::DeadLettered { seq, reason } => {
                warn!(seq, %reason, "Journal entry dead-lettered")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_serializes_with_tag() {
        let value = serde_json::to_value(Notification::RecoveryPending { count: 2 }).unwrap();
        assert_eq!(value["type"], "recovery_pending");
        assert_eq!(value["count"], 2);
    }

    #[test]
    fn test_builtin_notifiers_accept_everything() {
        let n = Notification::SafeModeEntered {
            power_state: PowerState::Critical,
        };
        NoOpNotifier.notify(&n);
        TracingNotifier.notify(&n);
    }
}
