//! Error types for the observation run sequencer
//!
//! Two layers of errors exist:
//! - [`DeviceError`]: failures reported by an instrument facade
//! - [`SequencerError`]: failures of sequencer operations (slews, waits,
//!   repositioning, schedule handling)
//!
//! Gate failures inside the scan executor never surface as errors. They are
//! converted into a failed scan status with a message and the run continues.

use thiserror::Error;

use crate::status::Instrument;

/// Error returned by a device facade
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("{device} does not support {operation}")]
    NotSupported {
        device: String,
        operation: String,
    },

    #[error("Hardware error: {device} - {message}")]
    Hardware {
        device: String,
        message: String,
    },

    #[error("Communication error: {0}")]
    Communication(String),
}

impl DeviceError {
    pub fn hardware(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hardware {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn not_supported(device: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            device: device.into(),
            operation: operation.into(),
        }
    }
}

/// Result type for device facade calls
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Error type for sequencer operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequencerError {
    // =========================================================================
    // Hardware
    // =========================================================================

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A guarded hardware command did not complete before its deadline
    #[error("Hardware timeout: '{command}' did not complete within {timeout_secs:.1}s")]
    Timeout {
        command: String,
        timeout_secs: f64,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Pointing and instrument configuration
    // =========================================================================

    #[error("Target altitude {altitude:.2} deg is below the minimum of {minimum:.2} deg")]
    BelowHorizon {
        altitude: f64,
        minimum: f64,
    },

    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    #[error("Invalid scan: {0}")]
    InvalidScan(String),

    // =========================================================================
    // Shared state, schedules and files
    // =========================================================================

    #[error("Status key {0} is already owned by another writer")]
    StatusKeyClaimed(Instrument),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SequencerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for SequencerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SequencerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Schedule(err.to_string())
    }
}

/// Result type for sequencer operations
pub type SequencerResult<T> = Result<T, SequencerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_converts() {
        let err: SequencerError = DeviceError::NotConnected("Camera".into()).into();
        assert_eq!(err.to_string(), "Device not connected: Camera");
    }

    #[test]
    fn test_timeout_message() {
        let err = SequencerError::Timeout {
            command: "slew".into(),
            timeout_secs: 60.0,
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("60.0s"));
    }
}
