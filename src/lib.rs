#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Fitlink
//!
//! A Rust library for streaming telemetry from Bluetooth Low Energy fitness sensors.
//!
//! Two sensor classes are supported, each driven by its own independent session:
//!
//! - **Heart-rate monitors** exposing the standard Bluetooth SIG Heart Rate service
//! - **VO2max metabolic sensors** exposing a vendor service with VO2, VCO2 and RQ
//!   characteristics
//!
//! ## Session Lifecycle
//!
//! A session moves through `Scanning → Connecting → ServiceDiscovery → Subscribing →
//! Streaming`, and ends in `Disconnected` when the link is lost. Platform callbacks are
//! turned into an ordered event channel consumed by a single state machine, so every
//! phase transition is published before any further work proceeds.
//!
//! Failures never escape the session as errors or panics. They are reported through
//! the human-readable connection state, which is the surface a UI displays.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fitlink::{ble::BtleplugCentral, SensorDevice};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let central = Arc::new(BtleplugCentral::new().await?);
//!     let monitor = SensorDevice::heart_rate(central);
//!     let mut observer = monitor.observer();
//!
//!     monitor.start_scan().await?;
//!
//!     while let Some(measurement) = observer.next_measurement().await {
//!         println!("{measurement}");
//!     }
//!
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Platform seam and scanner
pub mod ble;
/// Per-sensor device facade
pub mod device;
/// Error types and handling
pub mod error;
/// In-memory BLE central and scripted links for tests and simulations
pub mod mock;
/// Characteristic table and best-effort payload decoding
pub mod protocol;
/// Session state machine fed by one ordered event channel, and its driver
pub mod session;
/// Published, observable sensor state
pub mod state;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::SensorDevice;
pub use error::{FitlinkError, Result};
pub use state::{PublishedState, SensorState, StateObserver};
pub use types::{
    Authorization, Measurement, PeripheralIdentity, Permission, Readings, Role, SensorKind,
    SessionConfig, SessionPhase,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bluetooth SIG Heart Rate service
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Bluetooth SIG Heart Rate Measurement characteristic
pub const HEART_RATE_MEASUREMENT_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Client Characteristic Configuration Descriptor, used to enable notifications
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// VO2max vendor service
pub const VO2MAX_SERVICE_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def0);

/// VO2max oxygen uptake characteristic
pub const VO2_CHAR_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def1);

/// VO2max carbon dioxide output characteristic
pub const VCO2_CHAR_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def2);

/// VO2max respiratory quotient characteristic
pub const RQ_CHAR_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def3);
