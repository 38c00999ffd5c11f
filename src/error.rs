//! Custom error types for Corsair device orchestration.
//!
//! This module provides fine-grained error handling for device communication,
//! protocol parsing, profile references and input validation.

use thiserror::Error;

/// Main error type for device operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No matching device found during enumeration.
    #[error("No Corsair device found. Check USB connection and permissions.")]
    DeviceNotFound,

    /// HID communication error.
    #[error("HID communication error: {0}")]
    Hid(#[from] hidapi::HidError),

    /// Timed out waiting for a response carrying the expected data type.
    ///
    /// Carries the last buffer read so callers whose follow-up state is
    /// self-correcting can keep it.
    #[error("Timeout waiting for response type {expected:02X?}")]
    ResponseTimeout { expected: [u8; 2], last: Vec<u8> },

    /// Invalid or malformed response from device.
    #[error("Invalid response from device: {message}")]
    InvalidResponse { message: String },

    /// Referenced speed profile does not exist.
    #[error("Speed profile '{0}' not found")]
    UnknownSpeedProfile(String),

    /// Referenced RGB profile does not exist.
    #[error("RGB profile '{0}' not found")]
    UnknownRgbProfile(String),

    /// Liquid-temperature profiles need a pump channel to read from.
    #[error("Liquid temperature profiles require a device with a pump")]
    LiquidWithoutPump,

    /// Caller-facing validation failure. No state is mutated.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The operation does not apply to this device class.
    #[error("Operation not supported by this device")]
    Unsupported,

    /// The wireless child is not connected; the request was dropped.
    #[error("Device is offline")]
    Offline,

    /// Profile or config persistence failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Backup archive failure (create, verify or restore).
    #[error("Backup error: {0}")]
    Backup(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// True for the sentinel returns that map to "this device cannot do
    /// that" rather than a real failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, DeviceError::Unsupported | DeviceError::Offline)
    }
}

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_sentinels() {
        assert!(DeviceError::Unsupported.is_unsupported());
        assert!(DeviceError::Offline.is_unsupported());
        assert!(!DeviceError::DeviceNotFound.is_unsupported());
    }

    #[test]
    fn test_timeout_keeps_last_buffer() {
        let err = DeviceError::ResponseTimeout {
            expected: [0x06, 0x00],
            last: vec![0x01, 0x02],
        };
        match err {
            DeviceError::ResponseTimeout { last, .. } => assert_eq!(last, vec![0x01, 0x02]),
            _ => unreachable!(),
        }
    }
}
