use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    ble::BleCentral,
    error::{FitlinkError, Result},
    session::{SessionEvent, SessionHandle, SessionMachine},
    state::{PublishedState, SensorState, StateObserver},
    types::{Authorization, SensorKind, SessionConfig, SessionPhase},
};

/// Time allowed for a session to release its link before it is aborted
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// One sensor and its connection session
///
/// `SensorDevice` owns the sensor's published state for its whole lifetime.
/// Each call to [`SensorDevice::start_scan`] creates a fresh session that
/// writes into that state, so observers keep working across reconnects.
///
/// Heart-rate and VO2max devices are fully independent and can run
/// concurrently, even on the same central.
///
/// # Examples
///
/// ```no_run
/// use fitlink::{ble::BtleplugCentral, SensorDevice, SessionPhase};
/// use std::{sync::Arc, time::Duration};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let central = Arc::new(BtleplugCentral::new().await?);
///     let sensor = SensorDevice::vo2max(central);
///     let mut observer = sensor.observer();
///
///     sensor.start_scan().await?;
///     observer
///         .wait_for_phase(Duration::from_secs(30), |p| *p == SessionPhase::Streaming)
///         .await?;
///
///     println!("{:?}", sensor.state().readings);
///     Ok(())
/// }
/// ```
pub struct SensorDevice<C: BleCentral> {
    kind: SensorKind,
    central: Arc<C>,
    config: SessionConfig,
    authorization: Authorization,
    state: Arc<PublishedState>,
    session: Mutex<Option<SessionHandle>>,
}

impl<C: BleCentral> SensorDevice<C> {
    /// Create a device for `kind` with default configuration and all permissions granted
    #[must_use]
    pub fn new(kind: SensorKind, central: Arc<C>) -> Self {
        Self {
            kind,
            central,
            config: SessionConfig::default(),
            authorization: Authorization::granted(),
            state: Arc::new(PublishedState::new(kind)),
            session: Mutex::new(None),
        }
    }

    /// Heart-rate monitor
    #[must_use]
    pub fn heart_rate(central: Arc<C>) -> Self {
        Self::new(SensorKind::HeartRate, central)
    }

    /// VO2max sensor
    #[must_use]
    pub fn vo2max(central: Arc<C>) -> Self {
        Self::new(SensorKind::Vo2Max, central)
    }

    /// Replace the session configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use shared authorization flags, typically owned by the UI
    #[must_use]
    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }

    /// Sensor kind
    #[must_use]
    pub const fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Authorization flags consulted by new sessions
    #[must_use]
    pub const fn authorization(&self) -> &Authorization {
        &self.authorization
    }

    /// New observer of this sensor's published state
    #[must_use]
    pub fn observer(&self) -> StateObserver {
        self.state.observer()
    }

    /// Current published snapshot
    #[must_use]
    pub fn state(&self) -> SensorState {
        self.state.snapshot()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Scan for the sensor and connect to the first match
    ///
    /// Starting from `Idle` or a terminal phase creates a new session; any
    /// leftover session is torn down first. The outcome of the scan and
    /// connection is reported through the published state, not this result.
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::SessionActive`] without side effects while a
    /// session is still running, or [`FitlinkError::PermissionDenied`] when
    /// scan authorization is missing (the denial is also published).
    pub async fn start_scan(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        let phase = self.state.phase();
        if phase.is_active() {
            warn!("{} scan requested while {:?}, ignoring", self.kind, phase);
            return Err(FitlinkError::SessionActive);
        }

        if let Some(previous) = session.take() {
            previous.shutdown(TEARDOWN_GRACE).await;
        }

        self.state.reset();
        let mut machine =
            SessionMachine::new(self.config.clone(), self.authorization.clone(), self.state.clone());
        let actions = machine.start()?;

        info!("Starting {} session", self.kind);
        *session = Some(SessionHandle::spawn(self.central.clone(), machine, actions));
        Ok(())
    }

    /// Tear down the running session as if the link were lost
    ///
    /// Does nothing when no session is running.
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::Disconnected`] if the session ended while the
    /// request was being delivered.
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(handle) if !handle.is_finished() => {
                info!("Disconnecting {} session", self.kind);
                handle.send(SessionEvent::LinkLost).await
            }
            _ => Ok(()),
        }
    }

    /// Whether notifications are flowing
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state.phase() == SessionPhase::Streaming
    }
}

impl<C: BleCentral> Drop for SensorDevice<C> {
    fn drop(&mut self) {
        let Some(handle) = self.session.get_mut().take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(handle.shutdown(TEARDOWN_GRACE));
            }
            Err(_) => handle.abort_handle().abort(),
        }
    }
}
