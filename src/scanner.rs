use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    AddressType, Central as _, CentralEvent, CentralState, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::{self, BoxStream, StreamExt as _};
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ScanConfig;
use crate::device::{DeviceKind, DiscoveredDevice};
use crate::error::{ScanError, ScanResult};
use crate::platform::{Permission, Platform, PlatformEvent, broadcast_stream};

/// Keys reported during the current discovery session.
struct Sightings<K>(Mutex<HashSet<K>>);

impl<K: Hash + Eq> Sightings<K> {
    fn new() -> Self {
        Sightings(Mutex::new(HashSet::new()))
    }

    fn reset(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// True the first time `key` is seen since the last reset.
    fn first_sighting(&self, key: K) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(key)
    }
}

/// `Platform` backed by a btleplug adapter.
///
/// Desktop stacks have no runtime permission or location prompts, so those
/// checks always pass. btleplug cannot power an adapter on, so a disabled
/// adapter is reported as refused.
pub struct BtleScanner {
    adapter: Option<Adapter>,
    discovery_timeout: Option<Duration>,
    discovering: Arc<AtomicBool>,
    sightings: Arc<Sightings<PeripheralId>>,
    finished: broadcast::Sender<PlatformEvent>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BtleScanner {
    pub async fn new(config: &ScanConfig) -> btleplug::Result<Self> {
        let manager = Manager::new().await?;
        let index = config.adapter_index.unwrap_or(0);
        let adapter = manager.adapters().await?.into_iter().nth(index);

        match &adapter {
            Some(adapter) => info!("Using adapter {}", adapter.adapter_info().await?),
            None => warn!("No Bluetooth adapter at index {index}"),
        }

        Ok(BtleScanner::with_adapter(adapter, config.discovery_timeout()))
    }

    pub fn with_adapter(adapter: Option<Adapter>, discovery_timeout: Option<Duration>) -> Self {
        let (finished, _) = broadcast::channel(4);
        BtleScanner {
            adapter,
            discovery_timeout,
            discovering: Arc::new(AtomicBool::new(false)),
            sightings: Arc::new(Sightings::new()),
            finished,
            timer: Mutex::new(None),
        }
    }

    fn adapter(&self) -> ScanResult<&Adapter> {
        self.adapter.as_ref().ok_or(ScanError::NoBluetoothAdapter)
    }

    fn replace_timer(&self, task: Option<JoinHandle<()>>) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = std::mem::replace(&mut *timer, task) {
            previous.abort();
        }
    }

    // Ends discovery after the configured window, like a classic inquiry does.
    fn spawn_timer(&self, adapter: Adapter, timeout: Duration) -> JoinHandle<()> {
        let discovering = self.discovering.clone();
        let finished = self.finished.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !discovering.swap(false, Ordering::AcqRel) {
                return;
            }
            debug!("Discovery window of {timeout:?} elapsed");
            if let Err(err) = adapter.stop_scan().await {
                warn!("Error stopping scan: {err}");
            }
            let _ = finished.send(PlatformEvent::DiscoveryFinished);
        })
    }
}

#[async_trait]
impl Platform for BtleScanner {
    async fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    async fn is_enabled(&self) -> ScanResult<bool> {
        let state = self.adapter()?.adapter_state().await?;
        debug!("Adapter state: {:?}", state);
        Ok(!matches!(state, CentralState::PoweredOff))
    }

    async fn request_enable(&self) -> ScanResult<bool> {
        warn!("Adapter is powered off and cannot be powered on from here");
        Ok(false)
    }

    async fn has_permission(&self, _permission: Permission) -> bool {
        true
    }

    async fn request_permissions(&self, _permissions: &[Permission]) -> bool {
        true
    }

    async fn is_location_enabled(&self) -> bool {
        true
    }

    async fn request_location(&self) -> bool {
        true
    }

    async fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }

    async fn start_discovery(&self) -> ScanResult<()> {
        let adapter = self.adapter()?;
        // Cached peripherals only send updates, so every session starts with a clean slate.
        self.sightings.reset();
        self.discovering.store(true, Ordering::Release);
        if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
            self.discovering.store(false, Ordering::Release);
            return Err(err.into());
        }

        let timer = self
            .discovery_timeout
            .map(|timeout| self.spawn_timer(adapter.clone(), timeout));
        self.replace_timer(timer);
        Ok(())
    }

    async fn cancel_discovery(&self) -> ScanResult<()> {
        self.replace_timer(None);
        if !self.discovering.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.adapter()?.stop_scan().await?;
        let _ = self.finished.send(PlatformEvent::DiscoveryFinished);
        Ok(())
    }

    async fn bonded_devices(&self) -> ScanResult<Vec<DiscoveredDevice>> {
        let mut devices = Vec::new();
        for peripheral in self.adapter()?.peripherals().await? {
            if let Some(properties) = peripheral.properties().await? {
                devices.push(device_from_properties(properties));
            }
        }
        Ok(devices)
    }

    async fn events(&self) -> ScanResult<BoxStream<'static, PlatformEvent>> {
        let adapter = self.adapter()?.clone();
        let discovering = self.discovering.clone();
        let sightings = self.sightings.clone();
        let central_events = adapter.events().await?;

        let found = central_events.filter_map(move |event| {
            let adapter = adapter.clone();
            let discovering = discovering.clone();
            let sightings = sightings.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)
                        if discovering.load(Ordering::Acquire)
                            && sightings.first_sighting(id.clone()) =>
                    {
                        lookup_device(&adapter, &id).await
                    }
                    CentralEvent::StateUpdate(CentralState::PoweredOff)
                        if discovering.swap(false, Ordering::AcqRel) =>
                    {
                        info!("Adapter powered off during discovery");
                        Some(PlatformEvent::DiscoveryFinished)
                    }
                    _ => None,
                }
            }
        });

        Ok(stream::select(found, broadcast_stream(self.finished.subscribe())).boxed())
    }
}

async fn lookup_device(adapter: &Adapter, id: &PeripheralId) -> Option<PlatformEvent> {
    let properties = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral.properties().await,
        Err(err) => Err(err),
    };
    match properties {
        Ok(properties) => properties.map(|p| PlatformEvent::DeviceFound(device_from_properties(p))),
        Err(err) => {
            warn!("Error reading properties of {:?}: {err}", id);
            None
        }
    }
}

fn device_from_properties(properties: PeripheralProperties) -> DiscoveredDevice {
    // Random addresses only exist on the low energy transport.
    let kind = match properties.address_type {
        Some(AddressType::Random) => DeviceKind::LowEnergy,
        _ => DeviceKind::Unknown,
    };
    let mut device = DiscoveredDevice::new(properties.address.to_string()).with_kind(kind);
    if let Some(name) = properties.local_name {
        device = device.with_name(name);
    }
    if let Some(rssi) = properties.rssi {
        device = device.with_rssi(rssi);
    }
    device
}

#[cfg(test)]
mod tests {
    use btleplug::api::BDAddr;

    use super::*;

    #[test]
    fn test_device_from_properties() {
        let properties = PeripheralProperties {
            address: BDAddr::from([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]),
            address_type: Some(AddressType::Random),
            local_name: Some("Tag".to_string()),
            rssi: Some(-72),
            ..Default::default()
        };
        let device = device_from_properties(properties);
        assert_eq!(device.address, "00:11:22:AA:BB:CC");
        assert_eq!(device.name.as_deref(), Some("Tag"));
        assert_eq!(device.kind, DeviceKind::LowEnergy);
        assert_eq!(device.rssi, Some(-72));
    }

    #[test]
    fn test_public_address_kind_unknown() {
        let properties = PeripheralProperties {
            address: BDAddr::from([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]),
            address_type: Some(AddressType::Public),
            ..Default::default()
        };
        let device = device_from_properties(properties);
        assert_eq!(device.kind, DeviceKind::Unknown);
        assert_eq!(device.rssi, None);
    }

    #[test]
    fn test_sightings_reset_per_session() {
        let sightings = Sightings::new();
        assert!(sightings.first_sighting("00:11:22:AA:BB:CC"));
        assert!(!sightings.first_sighting("00:11:22:AA:BB:CC"));
        assert!(sightings.first_sighting("66:77:88:99:AA:BB"));

        sightings.reset();
        assert!(sightings.first_sighting("00:11:22:AA:BB:CC"));
    }

    #[tokio::test]
    async fn test_without_adapter() {
        let scanner = BtleScanner::with_adapter(None, None);
        assert!(!scanner.has_adapter().await);
        assert!(!scanner.is_discovering().await);
        assert_eq!(scanner.start_discovery().await, Err(ScanError::NoBluetoothAdapter));
        assert!(scanner.cancel_discovery().await.is_ok());
        assert!(scanner.events().await.is_err());
    }
}
