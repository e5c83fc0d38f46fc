use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::{
    error::{FitlinkError, Result},
    types::{Measurement, Readings, SensorKind, SessionPhase},
};

/// Capacity of the measurement broadcast; slow observers skip older frames
const MEASUREMENT_CAPACITY: usize = 256;

/// Snapshot of everything published for one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorState {
    /// Sensor this state belongs to
    pub kind: SensorKind,
    /// Last-known measurement values
    pub readings: Readings,
    /// Connected device label, `N/A` before any device is found
    pub device_label: String,
    /// Current lifecycle phase
    pub phase: SessionPhase,
    /// Human-readable form of `phase`
    pub connection_state: String,
}

impl SensorState {
    /// Defaults published when a session is created
    #[must_use]
    pub fn initial(kind: SensorKind) -> Self {
        let phase = SessionPhase::Idle;
        Self {
            kind,
            readings: Readings::zeroed(kind),
            device_label: "N/A".to_string(),
            connection_state: phase.describe(kind),
            phase,
        }
    }
}

/// Observable per-sensor state
///
/// The session machine is the only writer. Observers obtained through
/// [`PublishedState::observer`] always read the latest committed snapshot and
/// can also follow every decoded measurement in emission order.
#[derive(Debug)]
pub struct PublishedState {
    kind: SensorKind,
    state: watch::Sender<SensorState>,
    measurements: broadcast::Sender<Measurement>,
}

impl PublishedState {
    /// Create state initialized to the defaults for `kind`
    #[must_use]
    pub fn new(kind: SensorKind) -> Self {
        let (state, _) = watch::channel(SensorState::initial(kind));
        let (measurements, _) = broadcast::channel(MEASUREMENT_CAPACITY);
        Self {
            kind,
            state,
            measurements,
        }
    }

    /// Sensor kind this state describes
    #[must_use]
    pub const fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> SensorState {
        self.state.borrow().clone()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase.clone()
    }

    /// New observer handle
    #[must_use]
    pub fn observer(&self) -> StateObserver {
        StateObserver {
            state: self.state.subscribe(),
            measurements: self.measurements.subscribe(),
        }
    }

    /// Restore the creation defaults
    pub fn reset(&self) {
        self.state.send_replace(SensorState::initial(self.kind));
    }

    /// Commit a phase transition together with its display string
    pub fn set_phase(&self, phase: SessionPhase) {
        let kind = self.kind;
        self.state.send_modify(|state| {
            state.connection_state = phase.describe(kind);
            state.phase = phase;
        });
    }

    /// Publish the connected device's label
    pub fn set_device_label(&self, label: &str) {
        self.state.send_modify(|state| state.device_label = label.to_string());
    }

    /// Zero the published measurements
    pub fn reset_readings(&self) {
        let kind = self.kind;
        self.state
            .send_modify(|state| state.readings = Readings::zeroed(kind));
    }

    /// Fold a decoded measurement into the readings and broadcast it
    ///
    /// Returns `false` if the measurement belongs to another sensor kind.
    pub fn record(&self, measurement: Measurement) -> bool {
        let applied = self
            .state
            .send_if_modified(|state| state.readings.apply(measurement));
        if applied {
            // No subscribers is fine.
            let _ = self.measurements.send(measurement);
        }
        applied
    }
}

/// Read-only view of a sensor's published state
#[derive(Debug)]
pub struct StateObserver {
    state: watch::Receiver<SensorState>,
    measurements: broadcast::Receiver<Measurement>,
}

impl StateObserver {
    /// Latest snapshot
    #[must_use]
    pub fn current(&self) -> SensorState {
        self.state.borrow().clone()
    }

    /// Wait for the next committed change and return it
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::Disconnected`] once the owning state is dropped.
    pub async fn changed(&mut self) -> Result<SensorState> {
        self.state
            .changed()
            .await
            .map_err(|_| FitlinkError::Disconnected)?;
        Ok(self.state.borrow_and_update().clone())
    }

    /// Wait until the published phase satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::Timeout`] if the phase is not reached in time,
    /// or [`FitlinkError::Disconnected`] once the owning state is dropped.
    pub async fn wait_for_phase<F>(&mut self, timeout: Duration, predicate: F) -> Result<SensorState>
    where
        F: FnMut(&SessionPhase) -> bool,
    {
        let mut predicate = predicate;
        let wait = self.state.wait_for(|state| predicate(&state.phase));
        let state = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| FitlinkError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|_| FitlinkError::Disconnected)?;
        Ok(state.clone())
    }

    /// Next decoded measurement in emission order
    ///
    /// Returns `None` once the owning state is dropped. Frames missed by a
    /// lagging observer are skipped.
    pub async fn next_measurement(&mut self) -> Option<Measurement> {
        loop {
            match self.measurements.recv().await {
                Ok(measurement) => return Some(measurement),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Observer lagged, skipped {} measurement(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Clone for StateObserver {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            measurements: self.measurements.resubscribe(),
        }
    }
}
