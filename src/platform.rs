use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt as _};
use tokio::sync::broadcast;

use crate::device::DiscoveredDevice;
use crate::error::ScanResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    CoarseLocation,
    Bluetooth,
    BluetoothAdmin,
}

/// Every permission that has to be granted before discovery may start.
pub const REQUIRED_PERMISSIONS: [Permission; 3] = [
    Permission::CoarseLocation,
    Permission::Bluetooth,
    Permission::BluetoothAdmin,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    DeviceFound(DiscoveredDevice),
    DiscoveryFinished,
}

/// The host's Bluetooth stack and the user-facing prompts around it.
///
/// The `request_*` methods stand for host dialogs: they resolve once the user
/// (or the host policy) has answered and report whether the request was
/// granted.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn has_adapter(&self) -> bool;

    async fn is_enabled(&self) -> ScanResult<bool>;
    async fn request_enable(&self) -> ScanResult<bool>;

    async fn has_permission(&self, permission: Permission) -> bool;
    async fn request_permissions(&self, permissions: &[Permission]) -> bool;

    async fn is_location_enabled(&self) -> bool;
    async fn request_location(&self) -> bool;

    async fn is_discovering(&self) -> bool;
    async fn start_discovery(&self) -> ScanResult<()>;
    async fn cancel_discovery(&self) -> ScanResult<()>;

    async fn bonded_devices(&self) -> ScanResult<Vec<DiscoveredDevice>>;

    /// Discovery events from now on. The stream ends when the host goes away.
    async fn events(&self) -> ScanResult<BoxStream<'static, PlatformEvent>>;
}

/// Adapts a broadcast receiver into an event stream, skipping over lag.
pub fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Event receiver lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
