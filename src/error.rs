use thiserror::Error;

/// Failures reported back across the method-call boundary. Each one ends the
/// request it belongs to; the caller may simply invoke start-scan again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("Bluetooth adapter is null, BT is not supported on this device")]
    NoBluetoothAdapter,
    #[error("Permission must be granted")]
    NoPermission,
    #[error("Bluetooth is disabled")]
    BluetoothDisabled,
    #[error("Gps need to be turned on to scan BT devices")]
    NoGps,
    #[error("A scan request is already waiting on the host")]
    ScanInProgress,
    #[error("Bluetooth host error: {0}")]
    Platform(String),
}

impl ScanError {
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::NoBluetoothAdapter => "error_no_bt",
            ScanError::NoPermission => "error_no_permission",
            ScanError::BluetoothDisabled => "error_bluetooth_disabled",
            ScanError::NoGps => "error_no_gps",
            ScanError::ScanInProgress => "error_scan_in_progress",
            ScanError::Platform(_) => "error_platform",
        }
    }
}

impl From<btleplug::Error> for ScanError {
    fn from(value: btleplug::Error) -> Self {
        Self::Platform(value.to_string())
    }
}

pub type ScanResult<T> = Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ScanError::NoBluetoothAdapter.code(), "error_no_bt");
        assert_eq!(ScanError::NoPermission.code(), "error_no_permission");
        assert_eq!(ScanError::BluetoothDisabled.code(), "error_bluetooth_disabled");
        assert_eq!(ScanError::NoGps.code(), "error_no_gps");
        assert_eq!(ScanError::Platform("dbus".into()).code(), "error_platform");
    }

    #[test]
    fn test_platform_message() {
        let err = ScanError::Platform("adapter went away".into());
        assert_eq!(err.to_string(), "Bluetooth host error: adapter went away");
    }
}
