use thiserror::Error;
use uuid::Uuid;

use crate::types::Permission;

/// Errors that can occur while talking to a fitness sensor
#[derive(Error, Debug)]
pub enum FitlinkError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No advertising device matched the scan filter
    #[error("Sensor device not found")]
    DeviceNotFound,

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    /// The caller lacks a Bluetooth authorization
    #[error("Missing {permission} permission")]
    PermissionDenied {
        /// Which authorization was missing
        permission: Permission,
    },

    /// The platform refused to start an advertisement scan
    #[error("Scan failed with code {code}")]
    ScanFailed {
        /// Platform scan error code
        code: i32,
    },

    /// A GATT cache refresh was attempted and failed
    #[error("GATT cache refresh failed: {0}")]
    CacheRefreshFailed(String),

    /// The platform offers no GATT cache refresh
    #[error("GATT cache refresh not supported on this platform")]
    CacheRefreshUnsupported,

    /// A notification payload did not match its characteristic's shape
    #[error("Malformed payload from {characteristic}: {len} byte(s)")]
    MalformedPayload {
        /// Characteristic that produced the payload
        characteristic: Uuid,
        /// Length of the rejected payload
        len: usize,
    },

    /// Notification from a characteristic outside the descriptor table
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),

    /// The expected service was not found after discovery
    #[error("Service {0} not found")]
    ServiceMissing(Uuid),

    /// The expected characteristic was not found under its service
    #[error("Characteristic {0} not found")]
    CharacteristicMissing(Uuid),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// A session is already running for this sensor
    #[error("A session is already active")]
    SessionActive,
}

/// Result type for fitlink operations
pub type Result<T> = std::result::Result<T, FitlinkError>;

impl FitlinkError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::AdapterUnavailable
                | Self::DeviceNotFound
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::Timeout { .. }
        )
    }

    /// Check if this error is handled locally without ending the session
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CacheRefreshFailed(_)
                | Self::CacheRefreshUnsupported
                | Self::MalformedPayload { .. }
                | Self::UnknownCharacteristic(_)
        )
    }

    /// Check if this error ends the current session attempt
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::ScanFailed { .. }
                | Self::ServiceMissing(_)
                | Self::CharacteristicMissing(_)
                | Self::AdapterUnavailable
        )
    }

    /// Platform scan error code used when a scan cannot be started
    ///
    /// Codes follow the Android `ScanCallback` numbering, which is what
    /// sensor companion apps surface to users.
    #[must_use]
    pub const fn scan_error_code(&self) -> i32 {
        match self {
            Self::ScanFailed { code } => *code,
            Self::AdapterUnavailable | Self::Ble(btleplug::Error::NotSupported(_)) => {
                SCAN_FAILED_FEATURE_UNSUPPORTED
            }
            _ => SCAN_FAILED_INTERNAL_ERROR,
        }
    }
}

/// Scan failed due to an internal error
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

/// Scan failed because the adapter does not support LE scanning
pub const SCAN_FAILED_FEATURE_UNSUPPORTED: i32 = 4;
