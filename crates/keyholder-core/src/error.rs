//! Unified error types for the keyholder core library.
//!
//! This module provides a unified error type [`KeyholderError`] that covers all failure
//! modes across the keyholder system. Each module also has its own specific error types
//! (ConfigError, SessionError, ProvisioningError, BleError, RewardError) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Context preservation**: Wrapped errors maintain their original context
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use keyholder_core::error::{KeyholderError, Result};
//!
//! fn require_device(known: bool, id: &str) -> Result<()> {
//!     if !known {
//!         return Err(KeyholderError::NotFound(id.to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all keyholder operations.
///
/// The first five variants form the taxonomy surfaced to API callers; the
/// remaining ones cover local infrastructure (Bluetooth, configuration, disk).
#[derive(Debug, Error)]
pub enum KeyholderError {
    // =========================================================================
    // DEVICE / SESSION ERRORS
    // =========================================================================
    /// Unknown device id, or the device is not in a forwarding-eligible state.
    #[error("Device not found: '{0}'. It may have gone offline or not be provisioned yet.")]
    NotFound(String),

    /// The device could not be reached (network failure or timeout).
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// The command is not valid for the device's current session phase.
    #[error("Device busy: {0}")]
    Busy(String),

    /// Missing or malformed request fields, or a value out of range.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Provisioning over Bluetooth failed.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No usable Bluetooth adapter on this host.
    #[error("Bluetooth is unavailable: {0}")]
    BluetoothUnavailable(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for keyholder operations.
pub type Result<T> = std::result::Result<T, KeyholderError>;

/// Short alias for [`KeyholderError`].
pub type Error = KeyholderError;

impl KeyholderError {
    /// Returns `true` for the caller-facing device taxonomy
    /// (not found, unreachable, busy, validation, provisioning).
    #[inline]
    #[must_use]
    pub const fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Unreachable(_)
                | Self::Busy(_)
                | Self::Validation(_)
                | Self::Provisioning(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if the proxy may retry the operation later.
    ///
    /// `Busy` and `Validation` are never retried automatically.
    #[inline]
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::BluetoothUnavailable(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::Validation(_) => 400,

            // 404 Not Found
            Self::NotFound(_) | Self::ConfigNotFound(_) => 404,

            // 409 Conflict - wrong phase
            Self::Busy(_) => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::Provisioning(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_) => {
                422
            }

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - upstream device failed
            Self::Unreachable(_) => 502,

            // 503 Service Unavailable - Bluetooth hardware issues
            Self::BluetoothUnavailable(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unreachable(_) => "UNREACHABLE",
            Self::Busy(_) => "BUSY",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Provisioning(_) => "PROVISIONING_ERROR",
            Self::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for KeyholderError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::LoadError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SaveError(message) => Self::PersistenceError(message),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::session::SessionError> for KeyholderError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::WrongPhase { .. } => Self::Busy(err.to_string()),
            SessionError::OutOfRange { .. }
            | SessionError::UnknownChannel(_)
            | SessionError::ChannelDisabled(_)
            | SessionError::NotButtonTriggered => Self::Validation(err.to_string()),
        }
    }
}

impl From<crate::provisioning::ProvisioningError> for KeyholderError {
    fn from(err: crate::provisioning::ProvisioningError) -> Self {
        use crate::provisioning::ProvisioningError;
        match err {
            ProvisioningError::NotProvisionable(id) => Self::NotFound(id),
            ProvisioningError::InvalidField { .. } => Self::Validation(err.to_string()),
            ProvisioningError::NoBluetooth => Self::BluetoothUnavailable(err.to_string()),
            ProvisioningError::Connect(_)
            | ProvisioningError::MissingCharacteristics(_)
            | ProvisioningError::WriteFailed { .. } => Self::Provisioning(err.to_string()),
        }
    }
}

impl From<crate::bluetooth::BleError> for KeyholderError {
    fn from(err: crate::bluetooth::BleError) -> Self {
        use crate::bluetooth::BleError;
        match err {
            BleError::AdapterNotFound | BleError::AdapterPoweredOff => {
                Self::BluetoothUnavailable(err.to_string())
            }
            BleError::InvalidAddress { .. } => Self::Validation(err.to_string()),
            BleError::PeripheralNotFound { address } => Self::NotFound(address),
            BleError::Gatt { .. } | BleError::Internal { .. } => {
                Self::Provisioning(err.to_string())
            }
        }
    }
}

impl From<crate::storage::StorageError> for KeyholderError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
