//! # Validation Module
//!
//! Input validation for terminal registration and resilience settings.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: Config load / registration call (this module)                │
//! │  ├── Names, addresses, fingerprints                                    │
//! │  └── Threshold ordering                                                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Database (SQLite)                                            │
//! │  ├── CHECK constraints on status columns                               │
//! │  ├── UNIQUE fingerprint among active terminals                         │
//! │  └── At most one active authoritative terminal                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::power::PowerThresholds;
use crate::record::tables;
use crate::terminal::TerminalRegistration;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_DISPLAY_NAME_LEN: usize = 100;
const MAX_FINGERPRINT_LEN: usize = 256;

/// Validates a terminal display name.
///
/// ## Example
/// ```rust
/// use meridian_core::validation::validate_display_name;
///
/// assert!(validate_display_name("Register 1").is_ok());
/// assert!(validate_display_name("  ").is_err());
/// ```
pub fn validate_display_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "display_name".to_string(),
        });
    }

    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "display_name".to_string(),
            max: MAX_DISPLAY_NAME_LEN,
        });
    }

    Ok(())
}

/// Validates a `host:port` address.
///
/// ## Rules
/// - Host must not be empty
/// - Port must be a number in 1..=65535
/// - IPv6 literals must be bracketed (`[::1]:5000`)
pub fn validate_address(address: &str) -> ValidationResult<()> {
    let invalid = |reason: &str| ValidationError::InvalidFormat {
        field: "address".to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;

    if host.is_empty() || host == "[]" {
        return Err(invalid("host is empty"));
    }

    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid("IPv6 hosts must be bracketed"));
    }

    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid("port must be between 1 and 65535")),
        Ok(_) => Ok(()),
    }
}

pub fn validate_fingerprint(fingerprint: &str) -> ValidationResult<()> {
    let fingerprint = fingerprint.trim();

    if fingerprint.is_empty() {
        return Err(ValidationError::Required {
            field: "hardware_fingerprint".to_string(),
        });
    }

    if fingerprint.len() > MAX_FINGERPRINT_LEN {
        return Err(ValidationError::TooLong {
            field: "hardware_fingerprint".to_string(),
            max: MAX_FINGERPRINT_LEN,
        });
    }

    Ok(())
}

/// Validates everything a terminal presents when registering.
pub fn validate_registration(reg: &TerminalRegistration) -> ValidationResult<()> {
    validate_display_name(&reg.display_name)?;
    validate_fingerprint(&reg.hardware_fingerprint)?;
    if let Some(ref address) = reg.address {
        validate_address(address)?;
    }
    Ok(())
}

/// Critical must sit strictly below low, and both within 1..=100.
pub fn validate_thresholds(thresholds: PowerThresholds) -> ValidationResult<()> {
    for (field, value) in [("low_threshold", thresholds.low), ("critical_threshold", thresholds.critical)] {
        if value == 0 || value > 100 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                min: 1,
                max: 100,
            });
        }
    }

    if thresholds.critical >= thresholds.low {
        return Err(ValidationError::InvalidFormat {
            field: "critical_threshold".to_string(),
            reason: format!(
                "must be below low_threshold ({} >= {})",
                thresholds.critical, thresholds.low
            ),
        });
    }

    Ok(())
}

pub fn validate_table_name(table: &str) -> ValidationResult<()> {
    if tables::is_known(table) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            field: "table".to_string(),
            reason: format!("'{}' is not a synchronized table", table),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::TerminalRole;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("192.168.1.10:5000").is_ok());
        assert!(validate_address("till-01.local:8000").is_ok());
        assert!(validate_address("[fe80::1]:5000").is_ok());

        assert!(validate_address("192.168.1.10").is_err());
        assert!(validate_address(":5000").is_err());
        assert!(validate_address("host:0").is_err());
        assert!(validate_address("host:99999").is_err());
        assert!(validate_address("fe80::1:5000").is_err());
    }

    #[test]
    fn test_validate_thresholds() {
        assert!(validate_thresholds(PowerThresholds::default()).is_ok());
        assert!(validate_thresholds(PowerThresholds { low: 10, critical: 10 }).is_err());
        assert!(validate_thresholds(PowerThresholds { low: 0, critical: 0 }).is_err());
        assert!(validate_thresholds(PowerThresholds { low: 120, critical: 10 }).is_err());
    }

    #[test]
    fn test_validate_registration() {
        let mut reg = TerminalRegistration {
            terminal_id: None,
            display_name: "Register 2".into(),
            role: TerminalRole::Satellite,
            address: Some("10.0.0.12:5000".into()),
            hardware_fingerprint: "a1b2c3".into(),
            app_version: Some("1.4.0".into()),
        };
        assert!(validate_registration(&reg).is_ok());

        reg.hardware_fingerprint = " ".into();
        assert_eq!(
            validate_registration(&reg),
            Err(ValidationError::Required {
                field: "hardware_fingerprint".into()
            })
        );
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("products").is_ok());
        assert!(validate_table_name("users").is_err());
    }
}
