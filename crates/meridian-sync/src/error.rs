//! # Resilience Error Types
//!
//! Error types for the background services.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Resilience Error Categories                          │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Connectivity   │  │     Journal / Sync      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Network        │  │  JournalEntryApplyFailed│ │
//! │  │  ConfigLoad     │  │   Unavailable   │  │  CorruptJournalRecord   │ │
//! │  │  ConfigSave     │  │  StoreUnavail.  │  │  ConflictUnresolved     │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │     Power       │  │  Checkpoints    │  │      Registry           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  PowerQuery     │  │  CheckpointWrite│  │  RegistrationConflict   │ │
//! │  │   Timeout       │  │  SafeModeActive │  │  AuthoritativeConflict  │ │
//! │  │  PowerSource    │  │  Recovery       │  │  TerminalNotFound       │ │
//! │  │   Failed        │  │   Required      │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Contained errors are logged and folded into a cycle result or a retry
//! count; they never stop a background loop.

use meridian_core::{CoreError, ValidationError};
use thiserror::Error;

/// Result type alias for resilience operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid resilience configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// The authoritative terminal or its data path is unreachable.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The record store could not be opened or stopped answering mid-cycle.
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    /// A single store operation failed while the store itself was reachable.
    #[error("Record store error: {0}")]
    StoreError(String),

    // =========================================================================
    // Journal / Sync Errors
    // =========================================================================
    #[error("Journal entry {seq} could not be applied: {reason}")]
    JournalEntryApplyFailed { seq: i64, reason: String },

    /// A journal row whose payload can't be decoded. Quarantined, never retried.
    #[error("Journal entry {seq} is corrupt: {reason}")]
    CorruptJournalRecord { seq: i64, reason: String },

    #[error("Conflict on {table}/{record_id} left unresolved: {reason}")]
    ConflictUnresolved {
        table: String,
        record_id: String,
        reason: String,
    },

    // =========================================================================
    // Power Errors
    // =========================================================================
    #[error("Power source did not answer within {0} seconds")]
    PowerQueryTimeout(u64),

    #[error("Power source failed: {0}")]
    PowerSourceFailed(String),

    // =========================================================================
    // Checkpoint / Safe Mode Errors
    // =========================================================================
    #[error("Checkpoint for session {session_id} was not written: {reason}")]
    CheckpointWriteFailure { session_id: String, reason: String },

    /// New transactions are refused while the terminal is in safe mode.
    #[error("Safe mode is active: new transactions are not accepted")]
    SafeModeActive,

    /// The session was interrupted and must be recovered or discarded first.
    #[error("Session {session_id} is awaiting recovery")]
    RecoveryRequired { session_id: String },

    #[error("Session {0} is already closed")]
    SessionClosed(String),

    #[error("Hardware dispatch failed: {0}")]
    HardwareDispatchFailed(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Registration of {terminal_id} rejected: {reason}")]
    RegistrationConflict { terminal_id: String, reason: String },

    #[error("Terminal {existing} is already the authoritative terminal")]
    AuthoritativeConflict { existing: String },

    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Storage / Internal Errors
    // =========================================================================
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Resilience service is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Conversions
// =============================================================================

impl From<meridian_db::DbError> for SyncError {
    fn from(err: meridian_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(inner) => SyncError::Validation(inner),
            other => SyncError::SerializationFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed on a later attempt.
    ///
    /// ## Retryable Errors
    /// - Network and store outages
    /// - Power source timeouts
    /// - Per-entry apply failures (until the retry budget runs out)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_)
                | SyncError::StoreUnavailable(_)
                | SyncError::StoreError(_)
                | SyncError::JournalEntryApplyFailed { .. }
                | SyncError::PowerQueryTimeout(_)
                | SyncError::PowerSourceFailed(_)
                | SyncError::HardwareDispatchFailed(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Errors the background loops absorb: logged and counted, never fatal.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_)
                | SyncError::StoreUnavailable(_)
                | SyncError::StoreError(_)
                | SyncError::JournalEntryApplyFailed { .. }
                | SyncError::CorruptJournalRecord { .. }
                | SyncError::ConflictUnresolved { .. }
                | SyncError::PowerQueryTimeout(_)
                | SyncError::PowerSourceFailed(_)
                | SyncError::CheckpointWriteFailure { .. }
                | SyncError::HardwareDispatchFailed(_)
        )
    }

    /// Errors a point-of-sale caller should surface to the cashier.
    pub fn is_admission_refusal(&self) -> bool {
        matches!(
            self,
            SyncError::SafeModeActive | SyncError::RecoveryRequired { .. }
        )
    }
}
