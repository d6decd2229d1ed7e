//! # Error Types
//!
//! Domain-specific error types for meridian-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  meridian-core errors (this file)                                      │
//! │  ├── CoreError        - Envelope / domain rule failures                │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  meridian-db errors (separate crate)                                   │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  meridian-sync errors (separate crate)                                 │
//! │  └── SyncError        - Resilience taxonomy (network, journal, power)  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A payload envelope was written by a newer build than this one.
    ///
    /// ## When This Occurs
    /// - A terminal was downgraded while journal entries were still queued
    /// - A record was copied from a newer deployment
    #[error("Unsupported envelope version {found} (this build understands up to {supported})")]
    UnsupportedEnvelopeVersion { found: u32, supported: u32 },

    /// A payload could not be decoded into a known envelope kind.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A table name is not one this subsystem synchronizes.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Validation error wrapper.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::MalformedPayload(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field exceeds maximum length.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value is outside the allowed range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Field has invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts_into_core_error() {
        let err: CoreError = ValidationError::Required {
            field: "display_name".into(),
        }
        .into();

        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(err.to_string(), "Validation failed: display_name is required");
    }
}
