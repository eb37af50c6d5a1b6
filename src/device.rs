use std::str::FromStr as _;

use mac_address::MacAddress;
use serde_derive::Serialize;

/// Reported when the host gives no signal strength for a device.
pub const RSSI_UNKNOWN: i16 = i16::MIN;

const LOW_ENERGY_SUFFIX: &str = "-LE";

// btleplug can only tell low energy devices apart; the rest mirror host stacks that report more.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Classic,
    LowEnergy,
    Dual,
    Unknown,
}

/// A device as the host stack reports it, before it is mapped for the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub kind: DeviceKind,
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>) -> Self {
        DiscoveredDevice {
            address: address.into(),
            name: None,
            kind: DeviceKind::Unknown,
            rssi: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub name: String,
    pub address: String,
    pub rssi: String,
}

impl From<&DiscoveredDevice> for DeviceRecord {
    fn from(device: &DiscoveredDevice) -> Self {
        let address = normalize_address(&device.address);

        let mut name = device
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| address.clone());
        if device.kind == DeviceKind::LowEnergy && !name.contains(LOW_ENERGY_SUFFIX) {
            name.push_str(LOW_ENERGY_SUFFIX);
        }

        DeviceRecord {
            name,
            address,
            rssi: device.rssi.unwrap_or(RSSI_UNKNOWN).to_string(),
        }
    }
}

// Hosts differ in case and separators; anything that is not a MAC is kept as-is.
fn normalize_address(address: &str) -> String {
    MacAddress::from_str(address)
        .map(|mac| mac.to_string())
        .unwrap_or_else(|_| address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_falls_back_to_address() {
        let device = DiscoveredDevice::new("00:11:22:AA:BB:CC");
        let record = DeviceRecord::from(&device);
        assert_eq!(record.name, "00:11:22:AA:BB:CC");
        assert_eq!(record.address, "00:11:22:AA:BB:CC");

        let device = DiscoveredDevice::new("00:11:22:AA:BB:CC").with_name("");
        assert_eq!(DeviceRecord::from(&device).name, "00:11:22:AA:BB:CC");
    }

    #[test]
    fn test_low_energy_suffix() {
        let device = DiscoveredDevice::new("00:11:22:AA:BB:CC")
            .with_name("Thermometer")
            .with_kind(DeviceKind::LowEnergy);
        assert_eq!(DeviceRecord::from(&device).name, "Thermometer-LE");

        let device = device.with_name("Beacon-LE v2");
        assert_eq!(DeviceRecord::from(&device).name, "Beacon-LE v2");

        let device = device.with_name("Headset").with_kind(DeviceKind::Dual);
        assert_eq!(DeviceRecord::from(&device).name, "Headset");
    }

    #[test]
    fn test_unnamed_low_energy_device() {
        let device = DiscoveredDevice::new("00:11:22:AA:BB:CC").with_kind(DeviceKind::LowEnergy);
        assert_eq!(DeviceRecord::from(&device).name, "00:11:22:AA:BB:CC-LE");
    }

    #[test]
    fn test_rssi_sentinel() {
        let device = DiscoveredDevice::new("00:11:22:AA:BB:CC");
        assert_eq!(DeviceRecord::from(&device).rssi, "-32768");

        let device = device.with_rssi(-61);
        assert_eq!(DeviceRecord::from(&device).rssi, "-61");
    }

    #[test]
    fn test_address_normalization() {
        let device = DiscoveredDevice::new("00:11:22:aa:bb:cc");
        assert_eq!(DeviceRecord::from(&device).address, "00:11:22:AA:BB:CC");

        let device = DiscoveredDevice::new("hci0/dev_1");
        assert_eq!(DeviceRecord::from(&device).address, "hci0/dev_1");
    }
}
