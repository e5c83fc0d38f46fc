use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use uuid::Uuid;

use crate::{HEART_RATE_SERVICE_UUID, VO2MAX_SERVICE_UUID};

/// The two classes of sensor a session can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    /// Standard Bluetooth SIG heart-rate monitor
    HeartRate,
    /// Vendor VO2max / metabolic sensor
    Vo2Max,
}

impl SensorKind {
    /// Service UUID used as the advertisement scan filter
    #[must_use]
    pub const fn service_uuid(self) -> Uuid {
        match self {
            Self::HeartRate => HEART_RATE_SERVICE_UUID,
            Self::Vo2Max => VO2MAX_SERVICE_UUID,
        }
    }

    /// Whether the GATT cache is refreshed before service discovery
    ///
    /// Some VO2max peripherals report stale service tables after re-pairing.
    #[must_use]
    pub const fn refreshes_cache_by_default(self) -> bool {
        matches!(self, Self::Vo2Max)
    }

    const fn scanning_label(self) -> &'static str {
        match self {
            Self::HeartRate => "Scanning...",
            Self::Vo2Max => "Scanning for VO2Max...",
        }
    }

    const fn streaming_label(self) -> &'static str {
        match self {
            Self::HeartRate => "Subscribed to HR",
            Self::Vo2Max => "Subscribed to VO2, VCO2, and RQ",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "Heart Rate"),
            Self::Vo2Max => write!(f, "VO2Max"),
        }
    }
}

/// Bluetooth authorizations a session needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Permission to run advertisement scans
    Scan,
    /// Permission to open GATT connections
    Connect,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => write!(f, "BLUETOOTH_SCAN"),
            Self::Connect => write!(f, "BLUETOOTH_CONNECT"),
        }
    }
}

/// Lifecycle phase of one sensor session
///
/// The human-readable form published to observers comes from
/// [`SessionPhase::describe`], which depends on the sensor kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No session has been started
    Idle,
    /// Advertisement scan in progress
    Scanning,
    /// GATT connection requested
    Connecting,
    /// Link established, enumerating services
    ServiceDiscovery {
        /// Whether a GATT cache refresh precedes discovery
        refreshing_cache: bool,
    },
    /// Writing notification-enable descriptors
    Subscribing,
    /// Subscription requests issued, notifications flowing
    Streaming,
    /// Link lost; a new scan is required
    Disconnected,
    /// A required authorization is missing
    PermissionDenied(Permission),
    /// Scan authorization was withdrawn while a result was pending
    ScanStopped,
    /// The platform refused to start the scan
    ScanFailed(i32),
    /// The scan window elapsed without a matching advertisement
    NoDeviceFound,
    /// The expected service or characteristics were not found
    SubscriptionFailed(String),
}

impl SessionPhase {
    /// Human-readable connection state for display
    #[must_use]
    pub fn describe(&self, kind: SensorKind) -> String {
        match self {
            Self::Idle | Self::Disconnected => "Disconnected".to_string(),
            Self::Scanning => kind.scanning_label().to_string(),
            Self::Connecting => "Device found, connecting...".to_string(),
            Self::ServiceDiscovery {
                refreshing_cache: false,
            } => "Connected! Discovering services...".to_string(),
            Self::ServiceDiscovery {
                refreshing_cache: true,
            } => "Connected. Refreshing cache...".to_string(),
            Self::Subscribing => "Subscribing...".to_string(),
            Self::Streaming => kind.streaming_label().to_string(),
            Self::PermissionDenied(Permission::Scan) => {
                format!("No {} permission", Permission::Scan)
            }
            Self::PermissionDenied(Permission::Connect) => {
                "Connect failed, missing permission".to_string()
            }
            Self::ScanStopped => "Scan stopped, missing permission".to_string(),
            Self::ScanFailed(code) => format!("Scan Failed: Code {code}"),
            Self::NoDeviceFound => "No device found".to_string(),
            Self::SubscriptionFailed(reason) => format!("Subscription failed: {reason}"),
        }
    }

    /// Whether a session in this phase has ended
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::PermissionDenied(_)
                | Self::ScanStopped
                | Self::ScanFailed(_)
                | Self::NoDeviceFound
                | Self::SubscriptionFailed(_)
        )
    }

    /// Whether a session in this phase still owns platform resources
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }
}

/// A discovered peripheral
///
/// Replaced, never mutated, on each new scan result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralIdentity {
    /// Platform device reference
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
}

impl PeripheralIdentity {
    /// Create a new identity
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Label shown to observers, `Unknown` when the device advertised no name
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// What a characteristic measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Heart-rate measurement in beats per minute
    HeartRateMeasurement,
    /// Oxygen uptake
    Vo2,
    /// Carbon dioxide output
    Vco2,
    /// Respiratory quotient
    Rq,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRateMeasurement => write!(f, "heart-rate-measurement"),
            Self::Vo2 => write!(f, "vo2"),
            Self::Vco2 => write!(f, "vco2"),
            Self::Rq => write!(f, "rq"),
        }
    }
}

/// A decoded physiological value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Measurement {
    /// Beats per minute
    HeartRate(u16),
    /// Oxygen uptake
    Vo2(f32),
    /// Carbon dioxide output
    Vco2(f32),
    /// Respiratory quotient
    Rq(f32),
}

impl Measurement {
    /// Characteristic role that produced this value
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::HeartRate(_) => Role::HeartRateMeasurement,
            Self::Vo2(_) => Role::Vo2,
            Self::Vco2(_) => Role::Vco2,
            Self::Rq(_) => Role::Rq,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate(bpm) => write!(f, "{bpm} bpm"),
            Self::Vo2(value) => write!(f, "VO2 {value:.2}"),
            Self::Vco2(value) => write!(f, "VCO2 {value:.2}"),
            Self::Rq(value) => write!(f, "RQ {value:.2}"),
        }
    }
}

/// Last-known values for one sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Readings {
    /// Heart-rate monitor values
    HeartRate {
        /// Beats per minute
        bpm: u16,
    },
    /// VO2max sensor values
    Vo2Max {
        /// Oxygen uptake
        vo2: f32,
        /// Carbon dioxide output
        vco2: f32,
        /// Respiratory quotient
        rq: f32,
    },
}

impl Readings {
    /// Zeroed readings for a sensor kind
    #[must_use]
    pub const fn zeroed(kind: SensorKind) -> Self {
        match kind {
            SensorKind::HeartRate => Self::HeartRate { bpm: 0 },
            SensorKind::Vo2Max => Self::Vo2Max {
                vo2: 0.0,
                vco2: 0.0,
                rq: 0.0,
            },
        }
    }

    /// Fold a measurement into these readings
    ///
    /// Returns `false` when the measurement belongs to the other sensor kind.
    pub fn apply(&mut self, measurement: Measurement) -> bool {
        match (self, measurement) {
            (Self::HeartRate { bpm }, Measurement::HeartRate(value)) => *bpm = value,
            (Self::Vo2Max { vo2, .. }, Measurement::Vo2(value)) => *vo2 = value,
            (Self::Vo2Max { vco2, .. }, Measurement::Vco2(value)) => *vco2 = value,
            (Self::Vo2Max { rq, .. }, Measurement::Rq(value)) => *rq = value,
            _ => return false,
        }
        true
    }
}

/// Session tuning parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between a cache refresh and service discovery in milliseconds
    pub settle_delay_ms: u64,
    /// GATT connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Give up scanning after this many milliseconds; `None` scans until a match
    pub scan_timeout_ms: Option<u64>,
    /// Override the per-sensor cache refresh default
    pub refresh_cache: Option<bool>,
    /// Capacity of the session event channel
    pub event_buffer: usize,
}

impl SessionConfig {
    /// Settle delay as a [`Duration`]
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Connect timeout as a [`Duration`]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Whether the session refreshes the GATT cache for this sensor kind
    #[must_use]
    pub fn refreshes_cache(&self, kind: SensorKind) -> bool {
        self.refresh_cache
            .unwrap_or_else(|| kind.refreshes_cache_by_default())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            connect_timeout_ms: 30_000,
            scan_timeout_ms: None,
            refresh_cache: None,
            event_buffer: 64,
        }
    }
}

/// Shared, runtime-adjustable Bluetooth authorization flags
///
/// Clones share state, so a UI can grant a permission after the prompt
/// resolves and running sessions observe it on their next check.
#[derive(Debug, Clone)]
pub struct Authorization {
    scan: Arc<AtomicBool>,
    connect: Arc<AtomicBool>,
}

impl Authorization {
    /// All permissions granted
    #[must_use]
    pub fn granted() -> Self {
        Self::with(true, true)
    }

    /// No permissions granted
    #[must_use]
    pub fn denied() -> Self {
        Self::with(false, false)
    }

    /// Explicit scan and connect flags
    #[must_use]
    pub fn with(scan: bool, connect: bool) -> Self {
        Self {
            scan: Arc::new(AtomicBool::new(scan)),
            connect: Arc::new(AtomicBool::new(connect)),
        }
    }

    /// Check a permission
    #[must_use]
    pub fn is_granted(&self, permission: Permission) -> bool {
        self.flag(permission).load(Ordering::Acquire)
    }

    /// Grant or revoke a permission
    pub fn set(&self, permission: Permission, granted: bool) {
        self.flag(permission).store(granted, Ordering::Release);
    }

    fn flag(&self, permission: Permission) -> &AtomicBool {
        match permission {
            Permission::Scan => &self.scan,
            Permission::Connect => &self.connect,
        }
    }
}

impl Default for Authorization {
    fn default() -> Self {
        Self::granted()
    }
}
