use futures::StreamExt;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    ble::{BleCentral, GattLink, GattService, Notification, Scanner},
    error::{FitlinkError, Result},
    protocol::{self, ENABLE_NOTIFICATION_VALUE},
    state::PublishedState,
    types::{Authorization, PeripheralIdentity, Permission, SensorKind, SessionConfig, SessionPhase},
    CLIENT_CHARACTERISTIC_CONFIG_UUID,
};

/// Inputs to the session state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The scanner accepted a device
    DeviceFound(PeripheralIdentity),
    /// The platform refused to start the scan
    ScanFailed {
        /// Platform error code
        code: i32,
    },
    /// Scan authorization was missing when the scan began
    ScanDenied,
    /// The scan ended without a matching advertisement
    NoDeviceFound,
    /// The GATT link came up
    LinkEstablished,
    /// Service discovery finished
    ServicesResolved(Vec<GattService>),
    /// Service discovery raised an error
    DiscoveryFailed(String),
    /// All notification-enable writes have been issued
    SubscriptionsIssued,
    /// A characteristic notification arrived
    Notification(Notification),
    /// The link went down, or the owner asked to tear it down
    LinkLost,
}

/// Work the driver performs on the machine's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the single-shot scanner for a service
    Scan(Uuid),
    /// Open a GATT connection to a peripheral
    Connect(PeripheralIdentity),
    /// Best-effort GATT cache refresh
    RefreshCache,
    /// Discover services after a settle delay
    DiscoverServices {
        /// Delay before discovery starts
        delay: Duration,
    },
    /// Write the notification-enable value to each characteristic's CCCD
    EnableNotifications(Vec<Uuid>),
    /// Close and drop the GATT link
    ReleaseLink,
}

/// The per-session state machine
///
/// This is the only writer of its [`PublishedState`]. Every transition is
/// published before the actions it produces are returned.
#[derive(Debug)]
pub struct SessionMachine {
    kind: SensorKind,
    config: SessionConfig,
    authorization: Authorization,
    state: Arc<PublishedState>,
    phase: SessionPhase,
    peripheral: Option<PeripheralIdentity>,
    link_held: bool,
    history: Vec<SessionPhase>,
}

impl SessionMachine {
    /// Create an idle machine writing to `state`
    #[must_use]
    pub fn new(
        config: SessionConfig,
        authorization: Authorization,
        state: Arc<PublishedState>,
    ) -> Self {
        Self {
            kind: state.kind(),
            config,
            authorization,
            state,
            phase: SessionPhase::Idle,
            peripheral: None,
            link_held: false,
            history: Vec::new(),
        }
    }

    /// Sensor kind this machine drives
    #[must_use]
    pub const fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Authorization flags consulted by this session
    #[must_use]
    pub const fn authorization(&self) -> &Authorization {
        &self.authorization
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// Device targeted by this session, once found
    #[must_use]
    pub const fn peripheral(&self) -> Option<&PeripheralIdentity> {
        self.peripheral.as_ref()
    }

    /// Every phase entered so far, in order
    #[must_use]
    pub fn history(&self) -> &[SessionPhase] {
        &self.history
    }

    /// Whether the session has ended and released its link
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.phase.is_terminal() && !self.link_held
    }

    /// Leave `Idle` and begin scanning
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::SessionActive`] if the machine already left
    /// `Idle`, or [`FitlinkError::PermissionDenied`] after publishing the
    /// denial phase when scan authorization is missing.
    pub fn start(&mut self) -> Result<Vec<Action>> {
        if self.phase != SessionPhase::Idle {
            return Err(FitlinkError::SessionActive);
        }

        if !self.authorization.is_granted(Permission::Scan) {
            self.transition(SessionPhase::PermissionDenied(Permission::Scan));
            return Err(FitlinkError::PermissionDenied {
                permission: Permission::Scan,
            });
        }

        self.transition(SessionPhase::Scanning);
        Ok(vec![Action::Scan(self.kind.service_uuid())])
    }

    /// Apply one event
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        match (self.phase.clone(), event) {
            (_, SessionEvent::LinkLost) => self.lose_link(),
            (SessionPhase::Scanning, SessionEvent::DeviceFound(peripheral)) => {
                self.accept_device(peripheral)
            }
            (SessionPhase::Scanning, SessionEvent::ScanFailed { code }) => {
                self.transition(SessionPhase::ScanFailed(code));
                Vec::new()
            }
            (SessionPhase::Scanning, SessionEvent::ScanDenied) => {
                self.transition(SessionPhase::PermissionDenied(Permission::Scan));
                Vec::new()
            }
            (SessionPhase::Scanning, SessionEvent::NoDeviceFound) => {
                self.transition(SessionPhase::NoDeviceFound);
                Vec::new()
            }
            (SessionPhase::Connecting, SessionEvent::LinkEstablished) => {
                let refreshing_cache = self.config.refreshes_cache(self.kind);
                self.transition(SessionPhase::ServiceDiscovery { refreshing_cache });
                if refreshing_cache {
                    vec![
                        Action::RefreshCache,
                        Action::DiscoverServices {
                            delay: self.config.settle_delay(),
                        },
                    ]
                } else {
                    vec![Action::DiscoverServices {
                        delay: Duration::ZERO,
                    }]
                }
            }
            (SessionPhase::ServiceDiscovery { .. }, SessionEvent::ServicesResolved(services)) => {
                self.subscribe(&services)
            }
            (SessionPhase::ServiceDiscovery { .. }, SessionEvent::DiscoveryFailed(reason)) => {
                self.fail_subscription(format!("discovery error: {reason}"))
            }
            (SessionPhase::Subscribing, SessionEvent::SubscriptionsIssued) => {
                self.transition(SessionPhase::Streaming);
                Vec::new()
            }
            (
                SessionPhase::Subscribing | SessionPhase::Streaming,
                SessionEvent::Notification(notification),
            ) => {
                if let Some(measurement) = protocol::decode_for(
                    self.kind,
                    notification.characteristic,
                    &notification.value,
                ) {
                    debug!("UUID: {}, Value: {}", notification.characteristic, measurement);
                    self.state.record(measurement);
                }
                Vec::new()
            }
            (phase, event) => {
                debug!("Ignoring {:?} while {:?}", event, phase);
                Vec::new()
            }
        }
    }

    fn transition(&mut self, phase: SessionPhase) {
        info!("{} session: {}", self.kind, phase.describe(self.kind));
        self.state.set_phase(phase.clone());
        self.history.push(phase.clone());
        self.phase = phase;
    }

    fn accept_device(&mut self, peripheral: PeripheralIdentity) -> Vec<Action> {
        if !self.authorization.is_granted(Permission::Scan) {
            self.transition(SessionPhase::ScanStopped);
            return Vec::new();
        }

        self.state.set_device_label(peripheral.label());
        self.peripheral = Some(peripheral.clone());

        if !self.authorization.is_granted(Permission::Connect) {
            self.transition(SessionPhase::PermissionDenied(Permission::Connect));
            return Vec::new();
        }

        self.transition(SessionPhase::Connecting);
        self.link_held = true;
        vec![Action::Connect(peripheral)]
    }

    fn subscribe(&mut self, services: &[GattService]) -> Vec<Action> {
        let service_uuid = self.kind.service_uuid();
        let Some(service) = services.iter().find(|s| s.uuid == service_uuid) else {
            return self.fail_subscription(FitlinkError::ServiceMissing(service_uuid).to_string());
        };

        self.transition(SessionPhase::Subscribing);

        let mut targets = Vec::new();
        for descriptor in protocol::descriptors_for(self.kind) {
            match service.characteristic(descriptor.uuid) {
                Some(c) if c.has_descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID) => {
                    targets.push(descriptor.uuid);
                }
                Some(_) => warn!(
                    "{} characteristic {} has no client configuration descriptor",
                    descriptor.role, descriptor.uuid
                ),
                None => warn!(
                    "{}",
                    FitlinkError::CharacteristicMissing(descriptor.uuid)
                ),
            }
        }

        if targets.is_empty() {
            return self.fail_subscription(format!("no {} characteristics found", self.kind));
        }

        vec![Action::EnableNotifications(targets)]
    }

    fn fail_subscription(&mut self, reason: String) -> Vec<Action> {
        warn!("{} subscription failed: {}", self.kind, reason);
        self.transition(SessionPhase::SubscriptionFailed(reason));
        self.release()
    }

    fn lose_link(&mut self) -> Vec<Action> {
        if !self.phase.is_active() && !self.link_held {
            debug!("Link loss ignored while {:?}", self.phase);
            return Vec::new();
        }

        self.state.reset_readings();
        self.transition(SessionPhase::Disconnected);
        self.release()
    }

    fn release(&mut self) -> Vec<Action> {
        if std::mem::take(&mut self.link_held) {
            vec![Action::ReleaseLink]
        } else {
            Vec::new()
        }
    }
}

/// Executes a [`SessionMachine`]'s actions against a BLE central
pub struct SessionDriver<C: BleCentral> {
    central: Arc<C>,
    machine: SessionMachine,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    pending: VecDeque<SessionEvent>,
    link: Option<C::Link>,
    forwarders: Vec<JoinHandle<()>>,
}

impl<C: BleCentral> SessionDriver<C> {
    /// Create a driver for a machine
    #[must_use]
    pub fn new(central: Arc<C>, machine: SessionMachine) -> Self {
        let (events_tx, events_rx) = mpsc::channel(machine.config().event_buffer.max(1));
        Self {
            central,
            machine,
            events_tx,
            events_rx,
            pending: VecDeque::new(),
            link: None,
            forwarders: Vec::new(),
        }
    }

    /// Sender for injecting events into this session
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Perform `initial` and then process events until the session ends
    ///
    /// Returns the finished machine.
    pub async fn run(mut self, initial: Vec<Action>) -> SessionMachine {
        self.execute_all(initial).await;

        while !self.machine.is_finished() {
            let event = match self.pending.pop_front() {
                Some(event) => event,
                None => match self.events_rx.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };

            let actions = self.machine.handle(event);
            self.execute_all(actions).await;
        }

        self.release_link().await;
        info!("{} session ended: {:?}", self.machine.kind(), self.machine.phase());
        self.machine
    }

    async fn execute_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Scan(service) => self.scan(service).await,
            Action::Connect(peripheral) => self.connect(&peripheral).await,
            Action::RefreshCache => {
                let Some(link) = &self.link else { return };
                match link.refresh_cache().await {
                    Ok(()) => debug!("GATT cache refresh successful"),
                    Err(FitlinkError::CacheRefreshUnsupported) => {
                        debug!("GATT cache refresh not available, continuing");
                    }
                    Err(e) => warn!("An error occurred while refreshing device cache: {}", e),
                }
            }
            Action::DiscoverServices { delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let Some(link) = &self.link else { return };
                let event = match link.discover_services().await {
                    Ok(services) => SessionEvent::ServicesResolved(services),
                    Err(e) => SessionEvent::DiscoveryFailed(e.to_string()),
                };
                self.pending.push_back(event);
            }
            Action::EnableNotifications(characteristics) => {
                let Some(link) = &self.link else { return };
                for characteristic in characteristics {
                    if let Err(e) = link
                        .write_descriptor(
                            characteristic,
                            CLIENT_CHARACTERISTIC_CONFIG_UUID,
                            &ENABLE_NOTIFICATION_VALUE,
                        )
                        .await
                    {
                        warn!("Failed to enable notifications on {}: {}", characteristic, e);
                    }
                }
                self.pending.push_back(SessionEvent::SubscriptionsIssued);
            }
            Action::ReleaseLink => self.release_link().await,
        }
    }

    async fn scan(&mut self, service: Uuid) {
        let scan_timeout = self.machine.config().scan_timeout_ms.map(Duration::from_millis);
        let scanner = Scanner::new(
            self.central.as_ref(),
            service,
            self.machine.authorization().clone(),
        )
        .with_timeout(scan_timeout);

        let outcome = tokio::select! {
            outcome = scanner.first_match() => outcome,
            Some(event) = self.events_rx.recv() => {
                debug!("Scan interrupted by {:?}", event);
                if let Err(e) = self.central.stop_scan(service).await {
                    warn!("Failed to stop scan: {}", e);
                }
                self.pending.push_back(event);
                return;
            }
        };

        let event = match outcome {
            Ok(peripheral) => SessionEvent::DeviceFound(peripheral),
            Err(FitlinkError::PermissionDenied { .. }) => SessionEvent::ScanDenied,
            Err(FitlinkError::DeviceNotFound) => SessionEvent::NoDeviceFound,
            Err(e) => SessionEvent::ScanFailed {
                code: e.scan_error_code(),
            },
        };
        self.pending.push_back(event);
    }

    async fn connect(&mut self, peripheral: &PeripheralIdentity) {
        info!("Connecting to device: {}", peripheral.label());

        let link = match self.central.open_link(peripheral).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to open link to {}: {}", peripheral.label(), e);
                self.pending.push_back(SessionEvent::LinkLost);
                return;
            }
        };

        let connect_timeout = self.machine.config().connect_timeout();
        let timeout_ms = self.machine.config().connect_timeout_ms;

        let connected = {
            // Held before connecting so teardown can release a half-open link.
            let link = self.link.insert(link);
            let connect = timeout(connect_timeout, link.connect());
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    result = &mut connect => {
                        break result.unwrap_or(Err(FitlinkError::Timeout { timeout_ms }));
                    }
                    Some(event) = self.events_rx.recv() => {
                        let lost = event == SessionEvent::LinkLost;
                        self.pending.push_back(event);
                        if lost {
                            debug!("Connect to {} abandoned", peripheral.label());
                            return;
                        }
                    }
                }
            }
        };

        if let Err(e) = connected {
            warn!("Failed to connect to {}: {}", peripheral.label(), e);
            self.pending.push_back(SessionEvent::LinkLost);
            return;
        }

        self.spawn_forwarders().await;
        self.pending.push_back(SessionEvent::LinkEstablished);
    }

    async fn spawn_forwarders(&mut self) {
        let Some(link) = &self.link else { return };

        match link.link_lost().await {
            Ok(mut lost) => {
                let tx = self.events_tx.clone();
                self.forwarders.push(tokio::spawn(async move {
                    if lost.next().await.is_some() {
                        let _ = tx.send(SessionEvent::LinkLost).await;
                    }
                }));
            }
            Err(e) => warn!("Link loss will not be observed: {}", e),
        }

        match link.notifications().await {
            Ok(mut notifications) => {
                let tx = self.events_tx.clone();
                self.forwarders.push(tokio::spawn(async move {
                    while let Some(notification) = notifications.next().await {
                        if tx.send(SessionEvent::Notification(notification)).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => warn!("Notifications unavailable: {}", e),
        }
    }

    async fn release_link(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }

        if let Some(link) = self.link.take() {
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect while releasing link: {}", e);
            }
        }
    }
}

/// Handle to a running session task
#[derive(Debug)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    task: JoinHandle<SessionMachine>,
}

impl SessionHandle {
    /// Spawn a driver task for `machine`, starting with `initial` actions
    #[must_use]
    pub fn spawn<C: BleCentral>(
        central: Arc<C>,
        machine: SessionMachine,
        initial: Vec<Action>,
    ) -> Self {
        let driver = SessionDriver::new(central, machine);
        let events = driver.sender();
        let task = tokio::spawn(driver.run(initial));
        Self { events, task }
    }

    /// Inject an event into the session
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::Disconnected`] if the session already ended.
    pub async fn send(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| FitlinkError::Disconnected)
    }

    /// Whether the session task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Handle for aborting the task without consuming this handle
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Wait for the session to end and return its machine
    ///
    /// Returns `None` if the task was aborted.
    pub async fn join(self) -> Option<SessionMachine> {
        self.task.await.ok()
    }

    /// Tear the session down, aborting it if it does not end within `grace`
    pub async fn shutdown(self, grace: Duration) {
        if self.is_finished() {
            return;
        }
        let _ = self.events.send(SessionEvent::LinkLost).await;
        let abort = self.task.abort_handle();
        if timeout(grace, self.task).await.is_err() {
            warn!("Session did not stop within {:?}, aborting", grace);
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ble::GattCharacteristic,
        mock::{self, MockCentral, MockLink, RefreshBehavior},
        types::Readings,
        HEART_RATE_MEASUREMENT_CHAR_UUID, HEART_RATE_SERVICE_UUID, RQ_CHAR_UUID, VCO2_CHAR_UUID,
        VO2MAX_SERVICE_UUID, VO2_CHAR_UUID,
    };
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(5);

    fn machine(kind: SensorKind, authorization: Authorization) -> SessionMachine {
        SessionMachine::new(
            SessionConfig::default(),
            authorization,
            Arc::new(PublishedState::new(kind)),
        )
    }

    fn polar() -> PeripheralIdentity {
        PeripheralIdentity::new("hr-1", Some("Polar H10".to_string()))
    }

    fn drive_to_streaming(m: &mut SessionMachine, services: Vec<GattService>) {
        assert_ok!(m.start());
        m.handle(SessionEvent::DeviceFound(polar()));
        m.handle(SessionEvent::LinkEstablished);
        m.handle(SessionEvent::ServicesResolved(services));
        m.handle(SessionEvent::SubscriptionsIssued);
    }

    fn hr_notification(value: &[u8]) -> SessionEvent {
        SessionEvent::Notification(Notification {
            characteristic: HEART_RATE_MEASUREMENT_CHAR_UUID,
            value: value.to_vec(),
        })
    }

    #[test]
    fn test_heart_rate_happy_path() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());

        assert_eq!(
            m.start().unwrap(),
            vec![Action::Scan(HEART_RATE_SERVICE_UUID)]
        );
        assert_eq!(
            m.handle(SessionEvent::DeviceFound(polar())),
            vec![Action::Connect(polar())]
        );
        assert_eq!(
            m.handle(SessionEvent::LinkEstablished),
            vec![Action::DiscoverServices {
                delay: Duration::ZERO
            }]
        );
        assert_eq!(
            m.handle(SessionEvent::ServicesResolved(mock::heart_rate_services())),
            vec![Action::EnableNotifications(vec![
                HEART_RATE_MEASUREMENT_CHAR_UUID
            ])]
        );
        assert!(m.handle(SessionEvent::SubscriptionsIssued).is_empty());

        assert_eq!(
            m.history(),
            &[
                SessionPhase::Scanning,
                SessionPhase::Connecting,
                SessionPhase::ServiceDiscovery {
                    refreshing_cache: false
                },
                SessionPhase::Subscribing,
                SessionPhase::Streaming,
            ]
        );

        let published = m.state.snapshot();
        assert_eq!(published.device_label, "Polar H10");
        assert_eq!(published.connection_state, "Subscribed to HR");
    }

    #[test]
    fn test_notifications_update_readings_without_transition() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());
        drive_to_streaming(&mut m, mock::heart_rate_services());
        let transitions = m.history().len();

        m.handle(hr_notification(&[0x00, 0x4B]));
        assert_eq!(m.state.snapshot().readings, Readings::HeartRate { bpm: 75 });

        // A malformed frame is dropped and the stream continues.
        m.handle(hr_notification(&[]));
        assert_eq!(m.state.snapshot().readings, Readings::HeartRate { bpm: 75 });

        m.handle(hr_notification(&[0x01, 0x2C, 0x01]));
        assert_eq!(m.state.snapshot().readings, Readings::HeartRate { bpm: 300 });

        assert_eq!(m.history().len(), transitions);
        assert_eq!(m.phase(), &SessionPhase::Streaming);
    }

    #[test]
    fn test_vo2max_refreshes_cache_before_discovery() {
        let mut m = machine(SensorKind::Vo2Max, Authorization::granted());
        assert_eq!(m.start().unwrap(), vec![Action::Scan(VO2MAX_SERVICE_UUID)]);
        m.handle(SessionEvent::DeviceFound(polar()));

        assert_eq!(
            m.handle(SessionEvent::LinkEstablished),
            vec![
                Action::RefreshCache,
                Action::DiscoverServices {
                    delay: Duration::from_millis(500)
                }
            ]
        );
        assert_eq!(
            m.state.snapshot().connection_state,
            "Connected. Refreshing cache..."
        );
    }

    #[test]
    fn test_vo2max_refresh_disabled_by_config() {
        let config = SessionConfig {
            refresh_cache: Some(false),
            ..SessionConfig::default()
        };
        let mut m = SessionMachine::new(
            config,
            Authorization::granted(),
            Arc::new(PublishedState::new(SensorKind::Vo2Max)),
        );
        assert_ok!(m.start());
        m.handle(SessionEvent::DeviceFound(polar()));

        assert_eq!(
            m.handle(SessionEvent::LinkEstablished),
            vec![Action::DiscoverServices {
                delay: Duration::ZERO
            }]
        );
        assert_eq!(
            m.state.snapshot().connection_state,
            "Connected! Discovering services..."
        );
    }

    #[tokio::test]
    async fn test_frames_for_other_sensor_ignored() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());
        let mut observer = m.state.observer();
        drive_to_streaming(&mut m, mock::heart_rate_services());

        m.handle(SessionEvent::Notification(Notification {
            characteristic: VO2_CHAR_UUID,
            value: 2.0f32.to_le_bytes().to_vec(),
        }));
        m.handle(hr_notification(&[0x00, 0x3C]));

        assert_eq!(
            observer.next_measurement().await,
            Some(crate::Measurement::HeartRate(60))
        );
        assert_eq!(m.state.snapshot().readings, Readings::HeartRate { bpm: 60 });
    }

    #[test]
    fn test_vo2max_subscribes_to_present_characteristics() {
        let mut m = machine(SensorKind::Vo2Max, Authorization::granted());
        assert_ok!(m.start());
        m.handle(SessionEvent::DeviceFound(polar()));
        m.handle(SessionEvent::LinkEstablished);

        let partial = vec![GattService {
            uuid: VO2MAX_SERVICE_UUID,
            characteristics: vec![
                mock::notifying_characteristic(VO2_CHAR_UUID),
                GattCharacteristic {
                    uuid: VCO2_CHAR_UUID,
                    descriptors: Vec::new(),
                },
                mock::notifying_characteristic(RQ_CHAR_UUID),
            ],
        }];

        assert_eq!(
            m.handle(SessionEvent::ServicesResolved(partial)),
            vec![Action::EnableNotifications(vec![VO2_CHAR_UUID, RQ_CHAR_UUID])]
        );
        assert_eq!(m.phase(), &SessionPhase::Subscribing);
    }

    #[test]
    fn test_missing_service_fails_subscription() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());
        assert_ok!(m.start());
        m.handle(SessionEvent::DeviceFound(polar()));
        m.handle(SessionEvent::LinkEstablished);

        let actions = m.handle(SessionEvent::ServicesResolved(mock::vo2max_services()));
        assert_eq!(actions, vec![Action::ReleaseLink]);
        assert!(matches!(m.phase(), SessionPhase::SubscriptionFailed(_)));
        assert!(!m.history().contains(&SessionPhase::Subscribing));
        assert!(m.is_finished());

        // The released link's loss is not reported a second time.
        assert!(m.handle(SessionEvent::LinkLost).is_empty());
        assert!(matches!(m.phase(), SessionPhase::SubscriptionFailed(_)));
    }

    #[test]
    fn test_missing_characteristic_fails_subscription() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());
        assert_ok!(m.start());
        m.handle(SessionEvent::DeviceFound(polar()));
        m.handle(SessionEvent::LinkEstablished);

        let empty = vec![GattService {
            uuid: HEART_RATE_SERVICE_UUID,
            characteristics: Vec::new(),
        }];
        assert_eq!(
            m.handle(SessionEvent::ServicesResolved(empty)),
            vec![Action::ReleaseLink]
        );
        assert_eq!(
            m.state.snapshot().connection_state,
            "Subscription failed: no Heart Rate characteristics found"
        );
    }

    #[test]
    fn test_scan_permission_denied() {
        let mut m = machine(SensorKind::HeartRate, Authorization::denied());

        assert!(matches!(
            m.start(),
            Err(FitlinkError::PermissionDenied {
                permission: Permission::Scan
            })
        ));
        assert_eq!(
            m.state.snapshot().connection_state,
            "No BLUETOOTH_SCAN permission"
        );
        assert!(m.is_finished());
    }

    #[test]
    fn test_connect_permission_denied() {
        let auth = Authorization::with(true, false);
        let mut m = machine(SensorKind::HeartRate, auth);
        assert_ok!(m.start());

        assert!(m.handle(SessionEvent::DeviceFound(polar())).is_empty());
        let published = m.state.snapshot();
        assert_eq!(published.connection_state, "Connect failed, missing permission");
        assert_eq!(published.device_label, "Polar H10");
        assert!(!m.history().contains(&SessionPhase::Connecting));
    }

    #[test]
    fn test_scan_permission_revoked_before_result() {
        let auth = Authorization::granted();
        let mut m = machine(SensorKind::HeartRate, auth.clone());
        assert_ok!(m.start());

        auth.set(Permission::Scan, false);
        assert!(m.handle(SessionEvent::DeviceFound(polar())).is_empty());
        assert_eq!(m.phase(), &SessionPhase::ScanStopped);
    }

    #[test]
    fn test_scan_failure_reported_with_code() {
        let mut m = machine(SensorKind::Vo2Max, Authorization::granted());
        assert_ok!(m.start());
        m.handle(SessionEvent::ScanFailed { code: 2 });
        assert_eq!(m.state.snapshot().connection_state, "Scan Failed: Code 2");
        assert!(m.is_finished());
    }

    #[test]
    fn test_link_loss_resets_exactly_once() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());
        drive_to_streaming(&mut m, mock::heart_rate_services());
        m.handle(hr_notification(&[0x00, 0x50]));

        assert_eq!(m.handle(SessionEvent::LinkLost), vec![Action::ReleaseLink]);
        assert!(m.handle(SessionEvent::LinkLost).is_empty());

        let published = m.state.snapshot();
        assert_eq!(published.readings, Readings::HeartRate { bpm: 0 });
        assert_eq!(published.connection_state, "Disconnected");
        assert_eq!(
            m.history()
                .iter()
                .filter(|p| **p == SessionPhase::Disconnected)
                .count(),
            1
        );
    }

    #[test]
    fn test_link_loss_from_each_active_phase() {
        let steps: Vec<SessionEvent> = vec![
            SessionEvent::DeviceFound(polar()),
            SessionEvent::LinkEstablished,
            SessionEvent::ServicesResolved(mock::heart_rate_services()),
            SessionEvent::SubscriptionsIssued,
        ];

        for depth in 0..=steps.len() {
            let mut m = machine(SensorKind::HeartRate, Authorization::granted());
            assert_ok!(m.start());
            for event in steps.iter().take(depth) {
                m.handle(event.clone());
            }
            m.handle(SessionEvent::LinkLost);
            assert_eq!(m.phase(), &SessionPhase::Disconnected, "depth {depth}");
            assert!(m.is_finished());
        }
    }

    #[test]
    fn test_out_of_order_events_ignored() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());
        assert_ok!(m.start());

        assert!(m.handle(SessionEvent::SubscriptionsIssued).is_empty());
        assert!(m
            .handle(SessionEvent::ServicesResolved(mock::heart_rate_services()))
            .is_empty());
        assert!(m.handle(hr_notification(&[0x00, 0x4B])).is_empty());

        assert_eq!(m.phase(), &SessionPhase::Scanning);
        assert_eq!(m.state.snapshot().readings, Readings::HeartRate { bpm: 0 });
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut m = machine(SensorKind::HeartRate, Authorization::granted());
        assert_ok!(m.start());
        assert!(matches!(m.start(), Err(FitlinkError::SessionActive)));
    }

    fn spawn(
        central: MockCentral,
        kind: SensorKind,
        config: SessionConfig,
    ) -> (SessionHandle, crate::state::StateObserver) {
        let state = Arc::new(PublishedState::new(kind));
        let observer = state.observer();
        let mut m = SessionMachine::new(config, Authorization::granted(), state);
        let actions = m.start().unwrap();
        (SessionHandle::spawn(Arc::new(central), m, actions), observer)
    }

    #[tokio::test]
    async fn test_driver_streams_heart_rate() {
        let link = MockLink::heart_rate();
        let central = MockCentral::new();
        central.advertise(polar(), vec![HEART_RATE_SERVICE_UUID], link.clone());

        let (handle, mut observer) = spawn(central, SensorKind::HeartRate, SessionConfig::default());
        assert_ok!(
            observer
                .wait_for_phase(WAIT, |p| *p == SessionPhase::Streaming)
                .await
        );

        assert_eq!(
            link.writes()
                .iter()
                .map(|w| (w.characteristic, w.descriptor, w.value.clone()))
                .collect::<Vec<_>>(),
            vec![(
                HEART_RATE_MEASUREMENT_CHAR_UUID,
                CLIENT_CHARACTERISTIC_CONFIG_UUID,
                vec![0x01, 0x00]
            )]
        );

        assert!(link.notify(HEART_RATE_MEASUREMENT_CHAR_UUID, &[0x00, 0x4B]));
        assert_eq!(
            observer.next_measurement().await,
            Some(crate::Measurement::HeartRate(75))
        );

        link.drop_link();
        let state = observer
            .wait_for_phase(WAIT, |p| *p == SessionPhase::Disconnected)
            .await
            .unwrap();
        assert_eq!(state.readings, Readings::HeartRate { bpm: 0 });

        let machine = handle.join().await.unwrap();
        assert!(machine.is_finished());
        assert_eq!(link.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_settles_after_failed_refresh() {
        let link = MockLink::vo2max().with_refresh(RefreshBehavior::Fail);
        let central = MockCentral::new();
        central.advertise(polar(), vec![VO2MAX_SERVICE_UUID], link.clone());

        let (_handle, mut observer) = spawn(central, SensorKind::Vo2Max, SessionConfig::default());
        assert_ok!(
            observer
                .wait_for_phase(WAIT, |p| *p == SessionPhase::Streaming)
                .await
        );

        let refreshed = link.refreshed_at().unwrap();
        let discovered = link.discovered_at().unwrap();
        assert!(discovered.duration_since(refreshed) >= Duration::from_millis(500));
        assert_eq!(link.writes().len(), 3);

        link.notify(VO2_CHAR_UUID, &[0x00, 0x00, 0x48, 0x41]);
        assert_eq!(
            observer.next_measurement().await,
            Some(crate::Measurement::Vo2(12.5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_refresh_success_then_settle() {
        let link = MockLink::vo2max().with_refresh(RefreshBehavior::Succeed);
        let central = MockCentral::new();
        central.advertise(polar(), vec![VO2MAX_SERVICE_UUID], link.clone());

        let (_handle, mut observer) = spawn(central, SensorKind::Vo2Max, SessionConfig::default());
        assert_ok!(
            observer
                .wait_for_phase(WAIT, |p| *p == SessionPhase::Streaming)
                .await
        );

        let refreshed = link.refreshed_at().unwrap();
        let discovered = link.discovered_at().unwrap();
        assert!(discovered.duration_since(refreshed) >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_driver_skips_refresh_when_disabled() {
        let link = MockLink::vo2max().with_refresh(RefreshBehavior::Succeed);
        let central = MockCentral::new();
        central.advertise(polar(), vec![VO2MAX_SERVICE_UUID], link.clone());
        let config = SessionConfig {
            refresh_cache: Some(false),
            ..SessionConfig::default()
        };

        let (_handle, mut observer) = spawn(central, SensorKind::Vo2Max, config);
        assert_ok!(
            observer
                .wait_for_phase(WAIT, |p| *p == SessionPhase::Streaming)
                .await
        );
        assert!(link.refreshed_at().is_none());
        assert!(link.discovered_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_connect_timeout_disconnects() {
        let link = MockLink::heart_rate().hanging_connect();
        let central = MockCentral::new();
        central.advertise(polar(), vec![HEART_RATE_SERVICE_UUID], link.clone());
        let config = SessionConfig {
            connect_timeout_ms: 1_000,
            ..SessionConfig::default()
        };

        let (handle, observer) = spawn(central, SensorKind::HeartRate, config);
        let machine = handle.join().await.unwrap();

        assert_eq!(machine.phase(), &SessionPhase::Disconnected);
        let state = observer.current();
        assert_eq!(state.readings, Readings::HeartRate { bpm: 0 });
        assert_eq!(state.connection_state, "Disconnected");
        assert_eq!(link.connect_count(), 1);
        assert_eq!(link.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_interrupts_connect() {
        let link = MockLink::heart_rate().hanging_connect();
        let central = MockCentral::new();
        central.advertise(polar(), vec![HEART_RATE_SERVICE_UUID], link.clone());

        let (handle, mut observer) =
            spawn(central, SensorKind::HeartRate, SessionConfig::default());
        assert_ok!(
            observer
                .wait_for_phase(WAIT, |p| *p == SessionPhase::Connecting)
                .await
        );

        assert_ok!(handle.send(SessionEvent::LinkLost).await);
        let machine = timeout(WAIT, handle.join()).await.unwrap().unwrap();

        assert_eq!(machine.phase(), &SessionPhase::Disconnected);
        assert_eq!(link.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_driver_connect_failure_disconnects() {
        let link = MockLink::heart_rate().failing_connect();
        let central = MockCentral::new();
        central.advertise(polar(), vec![HEART_RATE_SERVICE_UUID], link.clone());

        let (handle, observer) = spawn(central, SensorKind::HeartRate, SessionConfig::default());
        let machine = handle.join().await.unwrap();

        assert_eq!(machine.phase(), &SessionPhase::Disconnected);
        assert_eq!(observer.current().device_label, "Polar H10");
        assert_eq!(link.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_scan_timeout() {
        let config = SessionConfig {
            scan_timeout_ms: Some(3_000),
            ..SessionConfig::default()
        };
        let (handle, _observer) = spawn(MockCentral::new(), SensorKind::Vo2Max, config);

        let machine = handle.join().await.unwrap();
        assert_eq!(machine.phase(), &SessionPhase::NoDeviceFound);
    }

    #[tokio::test]
    async fn test_teardown_interrupts_scan() {
        let (handle, mut observer) = spawn(
            MockCentral::new(),
            SensorKind::HeartRate,
            SessionConfig::default(),
        );
        assert_ok!(
            observer
                .wait_for_phase(WAIT, |p| *p == SessionPhase::Scanning)
                .await
        );

        handle.shutdown(WAIT).await;
        assert_eq!(observer.current().phase, SessionPhase::Disconnected);
        assert_err!(
            observer
                .wait_for_phase(Duration::from_millis(20), |p| *p == SessionPhase::Connecting)
                .await
        );
    }
}
