use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter},
    platform::{Adapter, Manager, Peripheral},
};
use futures::{
    future,
    stream::{BoxStream, StreamExt},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{FitlinkError, Result},
    protocol::ENABLE_NOTIFICATION_VALUE,
    types::{Authorization, PeripheralIdentity, Permission},
    CLIENT_CHARACTERISTIC_CONFIG_UUID,
};

/// A GATT service as resolved by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics under this service
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Find a characteristic by UUID
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// A GATT characteristic and the UUIDs of its descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Descriptor UUIDs
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// Check whether a descriptor is present
    #[must_use]
    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// A raw characteristic notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic that produced the value
    pub characteristic: Uuid,
    /// Raw payload
    pub value: Vec<u8>,
}

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertising device
    pub peripheral: PeripheralIdentity,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

/// One GATT connection to a peripheral
#[async_trait]
pub trait GattLink: Send + Sync + 'static {
    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Drop the platform's cached service table
    ///
    /// Platforms without such an operation keep the default, which reports
    /// [`FitlinkError::CacheRefreshUnsupported`].
    async fn refresh_cache(&self) -> Result<()> {
        Err(FitlinkError::CacheRefreshUnsupported)
    }

    /// Enumerate services, characteristics and descriptors
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Write a descriptor value
    async fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8])
        -> Result<()>;

    /// Stream of characteristic notifications
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>>;

    /// Stream that yields each time the platform reports the link lost
    async fn link_lost(&self) -> Result<BoxStream<'static, ()>>;

    /// Check if the link is up
    async fn is_connected(&self) -> bool;

    /// Close the connection and release the platform resource
    async fn disconnect(&self) -> Result<()>;
}

/// A BLE adapter acting in the central role
#[async_trait]
pub trait BleCentral: Send + Sync + 'static {
    /// Link type produced by this central
    type Link: GattLink;

    /// Start a low-latency scan filtered to `service`
    ///
    /// Scans for different services may overlap; each stream only yields
    /// advertisements carrying its own service.
    async fn start_scan(&self, service: Uuid) -> Result<BoxStream<'static, Advertisement>>;

    /// Stop the scan started for `service`, leaving other scans running
    async fn stop_scan(&self, service: Uuid) -> Result<()>;

    /// Create a link to a discovered peripheral without connecting it
    async fn open_link(&self, peripheral: &PeripheralIdentity) -> Result<Self::Link>;
}

/// What the adapter has to do after the set of active scans changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanChange {
    /// The adapter filter stays as it is
    Unchanged,
    /// Begin scanning with these service filters
    Start(Vec<Uuid>),
    /// Replace the running scan's service filters
    Restart(Vec<Uuid>),
    /// The last scan left; stop the adapter scan
    Stop,
}

/// Reference-counted service filters of the scans sharing one adapter
#[derive(Debug, Default)]
pub struct ScanRegistry {
    active: BTreeMap<Uuid, usize>,
}

impl ScanRegistry {
    /// Register one scan for `service`
    pub fn join(&mut self, service: Uuid) -> ScanChange {
        let was_scanning = self.is_scanning();
        let count = self.active.entry(service).or_insert(0);
        *count += 1;

        match (*count, was_scanning) {
            (1, false) => ScanChange::Start(self.filters()),
            (1, true) => ScanChange::Restart(self.filters()),
            _ => ScanChange::Unchanged,
        }
    }

    /// Unregister one scan for `service`
    pub fn leave(&mut self, service: Uuid) -> ScanChange {
        let Some(count) = self.active.get_mut(&service) else {
            return ScanChange::Unchanged;
        };
        *count -= 1;
        if *count > 0 {
            return ScanChange::Unchanged;
        }

        self.active.remove(&service);
        if self.is_scanning() {
            ScanChange::Restart(self.filters())
        } else {
            ScanChange::Stop
        }
    }

    /// Union of the active service filters
    #[must_use]
    pub fn filters(&self) -> Vec<Uuid> {
        self.active.keys().copied().collect()
    }

    /// Whether any scan is active
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        !self.active.is_empty()
    }

    /// Whether `service` is the only active filter
    #[must_use]
    pub fn is_only(&self, service: Uuid) -> bool {
        self.active.len() == 1 && self.active.contains_key(&service)
    }
}

/// Single-shot advertisement scanner
///
/// Accepts the first advertisement carrying the target service and stops
/// scanning. There is no RSSI ranking and no rescan.
pub struct Scanner<'a, C: BleCentral + ?Sized> {
    central: &'a C,
    service: Uuid,
    authorization: Authorization,
    timeout: Option<Duration>,
}

impl<'a, C: BleCentral + ?Sized> Scanner<'a, C> {
    /// Create a scanner for `service`
    #[must_use]
    pub const fn new(central: &'a C, service: Uuid, authorization: Authorization) -> Self {
        Self {
            central,
            service,
            authorization,
            timeout: None,
        }
    }

    /// Give up after `timeout`; `None` scans until a match
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Scan until the first matching advertisement
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::PermissionDenied`] without scanning if scan
    /// authorization is missing, [`FitlinkError::ScanFailed`] if the scan
    /// cannot be started, or [`FitlinkError::DeviceNotFound`] if the timeout
    /// elapses or the scan ends without a match.
    pub async fn first_match(&self) -> Result<PeripheralIdentity> {
        if !self.authorization.is_granted(Permission::Scan) {
            return Err(FitlinkError::PermissionDenied {
                permission: Permission::Scan,
            });
        }

        info!("Starting scan for service {}", self.service);
        let advertisements = self
            .central
            .start_scan(self.service)
            .await
            .map_err(|e| match e {
                FitlinkError::PermissionDenied { .. } => e,
                other => FitlinkError::ScanFailed {
                    code: other.scan_error_code(),
                },
            })?;

        let service = self.service;
        let mut matches =
            advertisements.filter(move |ad| future::ready(ad.services.contains(&service)));

        let found = match self.timeout {
            Some(limit) => timeout(limit, matches.next()).await.unwrap_or(None),
            None => matches.next().await,
        };

        if let Err(e) = self.central.stop_scan(self.service).await {
            warn!("Failed to stop scan: {}", e);
        }

        let peripheral = found.ok_or(FitlinkError::DeviceNotFound)?.peripheral;
        info!("Found device: {}", peripheral.label());
        Ok(peripheral)
    }
}

/// [`BleCentral`] backed by the host Bluetooth stack through btleplug
///
/// Sessions share the adapter's single scan. The scan runs with the union of
/// every active session's service filter and stops when the last one leaves.
pub struct BtleplugCentral {
    adapter: Adapter,
    scans: Arc<Mutex<ScanRegistry>>,
}

impl BtleplugCentral {
    /// Use the first Bluetooth adapter on this host
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::AdapterUnavailable`] if no adapter is present,
    /// or [`FitlinkError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(FitlinkError::AdapterUnavailable)?;

        Ok(Self::from_adapter(adapter))
    }

    /// Use a specific adapter
    #[must_use]
    pub fn from_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            scans: Arc::new(Mutex::new(ScanRegistry::default())),
        }
    }

    async fn apply(&self, change: ScanChange) -> Result<()> {
        match change {
            ScanChange::Unchanged => {}
            ScanChange::Start(services) => {
                self.adapter.start_scan(ScanFilter { services }).await?;
            }
            ScanChange::Restart(services) => {
                debug!("Restarting scan with filters {:?}", services);
                self.adapter.stop_scan().await?;
                self.adapter.start_scan(ScanFilter { services }).await?;
            }
            ScanChange::Stop => self.adapter.stop_scan().await?,
        }
        Ok(())
    }
}

fn peripheral_key(peripheral: &Peripheral) -> String {
    format!("{:?}", peripheral.id())
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    type Link = BtleplugLink;

    async fn start_scan(&self, service: Uuid) -> Result<BoxStream<'static, Advertisement>> {
        let events = self.adapter.events().await?;
        {
            let mut scans = self.scans.lock().await;
            let change = scans.join(service);
            if let Err(e) = self.apply(change).await {
                scans.leave(service);
                return Err(e);
            }
        }

        let adapter = self.adapter.clone();
        let scans = self.scans.clone();

        let advertisements = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let scans = scans.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };

                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;

                let mut services = properties.services;
                if !services.contains(&service) {
                    // Some stacks apply the scan filter but omit the UUID list.
                    if !services.is_empty() || !scans.lock().await.is_only(service) {
                        return None;
                    }
                    services.push(service);
                }

                let key = peripheral_key(&peripheral);
                debug!("Advertisement from {} ({:?})", key, properties.local_name);

                Some(Advertisement {
                    peripheral: PeripheralIdentity::new(key, properties.local_name),
                    services,
                })
            }
        });

        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self, service: Uuid) -> Result<()> {
        let mut scans = self.scans.lock().await;
        let change = scans.leave(service);
        self.apply(change).await
    }

    async fn open_link(&self, peripheral: &PeripheralIdentity) -> Result<BtleplugLink> {
        let found = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| peripheral_key(p) == peripheral.id)
            .ok_or(FitlinkError::DeviceNotFound)?;

        Ok(BtleplugLink {
            adapter: self.adapter.clone(),
            peripheral: found,
        })
    }
}

/// [`GattLink`] over a btleplug peripheral
///
/// btleplug exposes no GATT cache refresh, so this link reports the refresh
/// step as unsupported.
pub struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn connect(&self) -> Result<()> {
        self.peripheral
            .connect()
            .await
            .map_err(|e| FitlinkError::ConnectionFailed(e.to_string()))
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;

        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(FitlinkError::CharacteristicMissing(characteristic))?;

        // CoreBluetooth rejects raw CCCD writes; subscribe() performs the same write.
        if descriptor == CLIENT_CHARACTERISTIC_CONFIG_UUID
            && value == ENABLE_NOTIFICATION_VALUE.as_slice()
        {
            self.peripheral.subscribe(&target).await?;
            return Ok(());
        }

        let target_descriptor = target
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .ok_or(FitlinkError::CharacteristicMissing(characteristic))?;
        self.peripheral
            .write_descriptor(target_descriptor, value)
            .await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn link_lost(&self) -> Result<BoxStream<'static, ()>> {
        let id = self.peripheral.id();
        let events = self.adapter.events().await?;
        Ok(events
            .filter_map(move |event| {
                let lost = matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id);
                async move { lost.then_some(()) }
            })
            .boxed())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{MockCentral, MockLink},
        HEART_RATE_SERVICE_UUID, VO2MAX_SERVICE_UUID,
    };

    fn identity(id: &str, name: &str) -> PeripheralIdentity {
        PeripheralIdentity::new(id, Some(name.to_string()))
    }

    #[tokio::test]
    async fn test_scanner_accepts_first_match_only() {
        let central = MockCentral::new();
        central.advertise(
            identity("aa", "Thermometer"),
            vec![Uuid::from_u128(0x1809)],
            MockLink::heart_rate(),
        );
        central.advertise(
            identity("bb", "Polar H10"),
            vec![HEART_RATE_SERVICE_UUID],
            MockLink::heart_rate(),
        );
        central.advertise(
            identity("cc", "Wahoo TICKR"),
            vec![HEART_RATE_SERVICE_UUID],
            MockLink::heart_rate(),
        );

        let scanner = Scanner::new(&central, HEART_RATE_SERVICE_UUID, Authorization::granted());
        let found = scanner.first_match().await.unwrap();

        assert_eq!(found.id, "bb");
        assert_eq!(central.scans_started(), 1);
        assert_eq!(central.scans_stopped(), 1);
    }

    #[tokio::test]
    async fn test_scanner_requires_permission() {
        let central = MockCentral::new();
        let scanner = Scanner::new(&central, HEART_RATE_SERVICE_UUID, Authorization::denied());

        let result = scanner.first_match().await;
        assert!(matches!(
            result,
            Err(FitlinkError::PermissionDenied {
                permission: Permission::Scan
            })
        ));
        assert_eq!(central.scans_started(), 0);
    }

    #[tokio::test]
    async fn test_scanner_reports_scan_failure_code() {
        let central = MockCentral::new();
        central.fail_scan_with(2);
        let scanner = Scanner::new(&central, VO2MAX_SERVICE_UUID, Authorization::granted());

        let result = scanner.first_match().await;
        assert!(matches!(result, Err(FitlinkError::ScanFailed { code: 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_timeout() {
        let central = MockCentral::new();
        let scanner = Scanner::new(&central, VO2MAX_SERVICE_UUID, Authorization::granted())
            .with_timeout(Some(Duration::from_secs(10)));

        let result = scanner.first_match().await;
        assert!(matches!(result, Err(FitlinkError::DeviceNotFound)));
        assert_eq!(central.scans_stopped(), 1);
    }

    #[test]
    fn test_scan_registry_counts_overlapping_scans() {
        let mut scans = ScanRegistry::default();

        assert_eq!(
            scans.join(HEART_RATE_SERVICE_UUID),
            ScanChange::Start(vec![HEART_RATE_SERVICE_UUID])
        );
        assert_eq!(scans.join(HEART_RATE_SERVICE_UUID), ScanChange::Unchanged);
        assert!(scans.is_only(HEART_RATE_SERVICE_UUID));

        let both = scans.join(VO2MAX_SERVICE_UUID);
        assert!(matches!(&both, ScanChange::Restart(f) if f.len() == 2));

        assert_eq!(scans.leave(HEART_RATE_SERVICE_UUID), ScanChange::Unchanged);
        assert_eq!(
            scans.leave(HEART_RATE_SERVICE_UUID),
            ScanChange::Restart(vec![VO2MAX_SERVICE_UUID])
        );
        assert_eq!(scans.leave(HEART_RATE_SERVICE_UUID), ScanChange::Unchanged);
        assert_eq!(scans.leave(VO2MAX_SERVICE_UUID), ScanChange::Stop);
        assert!(!scans.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scanners_share_adapter() {
        let central = MockCentral::new();
        central.advertise(
            identity("hr", "Polar H10"),
            vec![HEART_RATE_SERVICE_UUID],
            MockLink::heart_rate(),
        );

        let vo2_scanner = Scanner::new(&central, VO2MAX_SERVICE_UUID, Authorization::granted());
        let vo2_scan = vo2_scanner.first_match();
        tokio::pin!(vo2_scan);
        assert!(timeout(Duration::from_millis(50), &mut vo2_scan).await.is_err());

        let hr_scanner = Scanner::new(&central, HEART_RATE_SERVICE_UUID, Authorization::granted());
        assert_eq!(hr_scanner.first_match().await.unwrap().id, "hr");

        // The heart-rate scan finished but the VO2max scan keeps the adapter on.
        assert!(central.adapter_scanning());
        assert_eq!(central.adapter_stops(), 0);

        central.advertise(
            identity("vo2", "Metabolic Cart"),
            vec![VO2MAX_SERVICE_UUID],
            MockLink::vo2max(),
        );
        assert_eq!(vo2_scan.await.unwrap().id, "vo2");
        assert!(!central.adapter_scanning());
        assert_eq!(central.adapter_stops(), 1);
    }

    #[test]
    fn test_service_lookup() {
        let service = GattService {
            uuid: HEART_RATE_SERVICE_UUID,
            characteristics: vec![GattCharacteristic {
                uuid: crate::HEART_RATE_MEASUREMENT_CHAR_UUID,
                descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
            }],
        };

        let characteristic = service
            .characteristic(crate::HEART_RATE_MEASUREMENT_CHAR_UUID)
            .unwrap();
        assert!(characteristic.has_descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID));
        assert!(service.characteristic(crate::VO2_CHAR_UUID).is_none());
    }
}
