use async_trait::async_trait;
use futures::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{sync::broadcast, time::Instant};
use uuid::Uuid;

use crate::{
    ble::{
        Advertisement, BleCentral, GattCharacteristic, GattLink, GattService, Notification,
        ScanChange, ScanRegistry,
    },
    error::{FitlinkError, Result},
    types::PeripheralIdentity,
    CLIENT_CHARACTERISTIC_CONFIG_UUID, HEART_RATE_MEASUREMENT_CHAR_UUID, HEART_RATE_SERVICE_UUID,
    RQ_CHAR_UUID, VCO2_CHAR_UUID, VO2MAX_SERVICE_UUID, VO2_CHAR_UUID,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn broadcast_stream<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(value) => return Some((value, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Characteristic with a client configuration descriptor
#[must_use]
pub fn notifying_characteristic(uuid: Uuid) -> GattCharacteristic {
    GattCharacteristic {
        uuid,
        descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
    }
}

/// GATT table of a standard heart-rate monitor
#[must_use]
pub fn heart_rate_services() -> Vec<GattService> {
    vec![GattService {
        uuid: HEART_RATE_SERVICE_UUID,
        characteristics: vec![notifying_characteristic(HEART_RATE_MEASUREMENT_CHAR_UUID)],
    }]
}

/// GATT table of the VO2max sensor
#[must_use]
pub fn vo2max_services() -> Vec<GattService> {
    vec![GattService {
        uuid: VO2MAX_SERVICE_UUID,
        characteristics: [VO2_CHAR_UUID, VCO2_CHAR_UUID, RQ_CHAR_UUID]
            .into_iter()
            .map(notifying_characteristic)
            .collect(),
    }]
}

/// How a [`MockLink`] answers a cache refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    /// Platform has no refresh operation
    Unsupported,
    /// Refresh succeeds
    Succeed,
    /// Refresh raises an error
    Fail,
}

/// A recorded descriptor write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Characteristic owning the descriptor
    pub characteristic: Uuid,
    /// Descriptor written
    pub descriptor: Uuid,
    /// Value written
    pub value: Vec<u8>,
}

#[derive(Debug)]
struct LinkInner {
    services: Mutex<Vec<GattService>>,
    refresh: Mutex<RefreshBehavior>,
    fail_connect: AtomicBool,
    hang_connect: AtomicBool,
    connected: AtomicBool,
    writes: Mutex<Vec<DescriptorWrite>>,
    notifications: broadcast::Sender<Notification>,
    lost: broadcast::Sender<()>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    refreshed_at: Mutex<Option<Instant>>,
    discovered_at: Mutex<Option<Instant>>,
}

/// Scripted [`GattLink`]
///
/// Clones share state, so a test keeps one clone to drive the link the
/// session is using.
#[derive(Debug, Clone)]
pub struct MockLink {
    inner: Arc<LinkInner>,
}

impl MockLink {
    /// Link exposing `services` after discovery
    #[must_use]
    pub fn new(services: Vec<GattService>) -> Self {
        let (notifications, _) = broadcast::channel(64);
        let (lost, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(LinkInner {
                services: Mutex::new(services),
                refresh: Mutex::new(RefreshBehavior::Unsupported),
                fail_connect: AtomicBool::new(false),
                hang_connect: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                writes: Mutex::new(Vec::new()),
                notifications,
                lost,
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                refreshed_at: Mutex::new(None),
                discovered_at: Mutex::new(None),
            }),
        }
    }

    /// Standard heart-rate monitor
    #[must_use]
    pub fn heart_rate() -> Self {
        Self::new(heart_rate_services())
    }

    /// VO2max sensor
    #[must_use]
    pub fn vo2max() -> Self {
        Self::new(vo2max_services())
    }

    /// Set the cache refresh behavior
    #[must_use]
    pub fn with_refresh(self, behavior: RefreshBehavior) -> Self {
        *lock(&self.inner.refresh) = behavior;
        self
    }

    /// Make every connect attempt fail
    #[must_use]
    pub fn failing_connect(self) -> Self {
        self.inner.fail_connect.store(true, Ordering::Release);
        self
    }

    /// Make every connect attempt wait forever
    #[must_use]
    pub fn hanging_connect(self) -> Self {
        self.inner.hang_connect.store(true, Ordering::Release);
        self
    }

    /// Emit a notification; returns `false` if nobody is listening
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) -> bool {
        self.inner
            .notifications
            .send(Notification {
                characteristic,
                value: value.to_vec(),
            })
            .is_ok()
    }

    /// Simulate the peripheral going out of range
    pub fn drop_link(&self) {
        self.inner.connected.store(false, Ordering::Release);
        let _ = self.inner.lost.send(());
    }

    /// Descriptor writes received so far
    #[must_use]
    pub fn writes(&self) -> Vec<DescriptorWrite> {
        lock(&self.inner.writes).clone()
    }

    /// Number of connect attempts
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::Acquire)
    }

    /// Number of disconnect calls
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::Acquire)
    }

    /// When the last cache refresh was requested
    #[must_use]
    pub fn refreshed_at(&self) -> Option<Instant> {
        *lock(&self.inner.refreshed_at)
    }

    /// When the last service discovery was requested
    #[must_use]
    pub fn discovered_at(&self) -> Option<Instant> {
        *lock(&self.inner.discovered_at)
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn connect(&self) -> Result<()> {
        self.inner.connects.fetch_add(1, Ordering::AcqRel);
        if self.inner.hang_connect.load(Ordering::Acquire) {
            future::pending::<()>().await;
        }
        if self.inner.fail_connect.load(Ordering::Acquire) {
            return Err(FitlinkError::ConnectionFailed("peripheral unreachable".into()));
        }
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn refresh_cache(&self) -> Result<()> {
        *lock(&self.inner.refreshed_at) = Some(Instant::now());
        match *lock(&self.inner.refresh) {
            RefreshBehavior::Unsupported => Err(FitlinkError::CacheRefreshUnsupported),
            RefreshBehavior::Succeed => Ok(()),
            RefreshBehavior::Fail => Err(FitlinkError::CacheRefreshFailed(
                "refresh raised an exception".into(),
            )),
        }
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        *lock(&self.inner.discovered_at) = Some(Instant::now());
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(FitlinkError::Disconnected);
        }
        Ok(lock(&self.inner.services).clone())
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        lock(&self.inner.writes).push(DescriptorWrite {
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        Ok(broadcast_stream(self.inner.notifications.subscribe()))
    }

    async fn link_lost(&self) -> Result<BoxStream<'static, ()>> {
        Ok(broadcast_stream(self.inner.lost.subscribe()))
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnects.fetch_add(1, Ordering::AcqRel);
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CentralInner {
    advertisements: Vec<Advertisement>,
    links: HashMap<String, MockLink>,
    scans: ScanRegistry,
    scan_error: Option<i32>,
    scans_started: usize,
    scans_stopped: usize,
    adapter_stops: usize,
}

/// Scripted [`BleCentral`] modelling one shared adapter
///
/// Every scan sees the advertisements already in range and then any added
/// later, but only while the adapter's combined filter admits them. A scan
/// that sees nothing more stays open, like a real one.
#[derive(Debug)]
pub struct MockCentral {
    inner: Arc<Mutex<CentralInner>>,
    on_air: broadcast::Sender<Advertisement>,
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCentral {
    /// Central with no peripherals in range
    #[must_use]
    pub fn new() -> Self {
        let (on_air, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(CentralInner::default())),
            on_air,
        }
    }

    /// Put a peripheral in range
    pub fn advertise(&self, peripheral: PeripheralIdentity, services: Vec<Uuid>, link: MockLink) {
        let advertisement = Advertisement {
            peripheral,
            services,
        };
        let mut inner = lock(&self.inner);
        inner
            .links
            .insert(advertisement.peripheral.id.clone(), link);
        inner.advertisements.push(advertisement.clone());
        // Running scans pick it up; none running is fine.
        let _ = self.on_air.send(advertisement);
    }

    /// Make scans fail to start with a platform error code
    pub fn fail_scan_with(&self, code: i32) {
        lock(&self.inner).scan_error = Some(code);
    }

    /// Number of scans started
    #[must_use]
    pub fn scans_started(&self) -> usize {
        lock(&self.inner).scans_started
    }

    /// Number of scans stopped
    #[must_use]
    pub fn scans_stopped(&self) -> usize {
        lock(&self.inner).scans_stopped
    }

    /// Whether the adapter is scanning for any session
    #[must_use]
    pub fn adapter_scanning(&self) -> bool {
        lock(&self.inner).scans.is_scanning()
    }

    /// Number of times the adapter scan was switched off
    #[must_use]
    pub fn adapter_stops(&self) -> usize {
        lock(&self.inner).adapter_stops
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    type Link = MockLink;

    async fn start_scan(&self, service: Uuid) -> Result<BoxStream<'static, Advertisement>> {
        let mut inner = lock(&self.inner);
        if let Some(code) = inner.scan_error {
            return Err(FitlinkError::ScanFailed { code });
        }
        inner.scans_started += 1;
        inner.scans.join(service);

        let in_range = inner.advertisements.clone();
        let later = broadcast_stream(self.on_air.subscribe());
        let adapter = self.inner.clone();

        Ok(stream::iter(in_range)
            .chain(later)
            .filter(move |ad| {
                let filters = lock(&adapter).scans.filters();
                future::ready(filters.iter().any(|s| ad.services.contains(s)))
            })
            .boxed())
    }

    async fn stop_scan(&self, service: Uuid) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.scans_stopped += 1;
        if inner.scans.leave(service) == ScanChange::Stop {
            inner.adapter_stops += 1;
        }
        Ok(())
    }

    async fn open_link(&self, peripheral: &PeripheralIdentity) -> Result<MockLink> {
        lock(&self.inner)
            .links
            .get(&peripheral.id)
            .cloned()
            .ok_or(FitlinkError::DeviceNotFound)
    }
}
