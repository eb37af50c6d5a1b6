use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt as _;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::DeviceRecord;
use crate::error::{ScanError, ScanResult};
use crate::messages::{Method, MethodCall, MethodResult, Notification};
use crate::platform::{Platform, PlatformEvent, REQUIRED_PERMISSIONS};

struct Registration {
    id: u64,
    task: JoinHandle<()>,
}

type ReceiverSlot = Arc<Mutex<Option<Registration>>>;

fn lock_slot(slot: &Mutex<Option<Registration>>) -> MutexGuard<'_, Option<Registration>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Notification listeners. Each gets an unbounded queue so a slow publisher
/// never loses a scan-stopped.
#[derive(Clone, Default)]
struct Subscribers(Arc<Mutex<Vec<mpsc::UnboundedSender<Notification>>>>);

impl Subscribers {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    fn send(&self, notification: Notification) {
        let mut subscribers = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("No listeners for {}", notification.method());
        }
    }
}

/// Releases the single in-flight start when dropped.
struct PendingScan<'a>(&'a AtomicBool);

impl Drop for PendingScan<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Manager<P> {
    platform: Arc<P>,
    notifications: Subscribers,
    pending_scan: AtomicBool,
    receiver: ReceiverSlot,
    next_receiver_id: AtomicU64,
}

impl<P: Platform + 'static> Manager<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Manager {
            platform,
            notifications: Subscribers::default(),
            pending_scan: AtomicBool::new(false),
            receiver: Arc::new(Mutex::new(None)),
            next_receiver_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.notifications.subscribe()
    }

    /// Walks the precondition chain, starts discovery and optionally returns
    /// the devices the host is already bonded with.
    pub async fn start_scan(&self, return_bonded_devices: bool) -> ScanResult<Vec<DeviceRecord>> {
        self.ensure_adapter().await?;
        let _pending = self.claim_pending()?;

        self.ensure_enabled().await?;
        self.ensure_permissions().await?;
        self.ensure_location().await?;

        if self.platform.is_discovering().await {
            info!("Discovery already running, restarting it");
            self.stop_discovery().await?;
        }

        // Fetched up front so a failure here leaves nothing running.
        let bonded = if return_bonded_devices {
            let bonded = self.platform.bonded_devices().await?;
            debug!("Returning {} bonded devices", bonded.len());
            bonded.iter().map(DeviceRecord::from).collect()
        } else {
            Vec::new()
        };

        self.register_receiver().await?;
        if let Err(err) = self.platform.start_discovery().await {
            self.unregister_receiver();
            return Err(err);
        }
        info!("Discovery started");
        Ok(bonded)
    }

    pub async fn stop_scan(&self) -> ScanResult<()> {
        self.ensure_adapter().await?;
        self.stop_discovery().await
    }

    /// Stops a running discovery before the bridge goes away.
    pub async fn shutdown(&self) {
        if self.platform.has_adapter().await && self.platform.is_discovering().await {
            if let Err(err) = self.stop_discovery().await {
                warn!("Error stopping discovery on shutdown: {err}");
            }
        }
        self.unregister_receiver();
    }

    pub async fn handle_call(&self, method: &Method) -> MethodResult {
        debug!("Handling method call {:?}", method);
        match method {
            Method::StartScan {
                return_bonded_devices,
            } => match self.start_scan(*return_bonded_devices).await {
                Ok(devices) => MethodResult::Devices(devices),
                Err(err) => MethodResult::Error(err),
            },
            Method::StopScan => match self.stop_scan().await {
                Ok(()) => MethodResult::Done,
                Err(err) => MethodResult::Error(err),
            },
            Method::Unknown(name) => match self.ensure_adapter().await {
                Ok(()) => {
                    warn!("Method {name} is not implemented");
                    MethodResult::NotImplemented
                }
                Err(err) => MethodResult::Error(err),
            },
        }
    }

    /// Answers calls until the channel closes. Each call runs on its own task
    /// so a stop is not held up by a start waiting on a host prompt.
    pub async fn serve(
        self: Arc<Self>,
        mut calls: mpsc::Receiver<MethodCall>,
        results: mpsc::Sender<(u64, MethodResult)>,
    ) {
        while let Some(call) = calls.recv().await {
            let manager = self.clone();
            let results = results.clone();
            tokio::spawn(async move {
                let result = manager.handle_call(&call.method).await;
                if results.send((call.id, result)).await.is_err() {
                    debug!("Result for call {} dropped, no listener", call.id);
                }
            });
        }
        debug!("Call channel closed");
        self.shutdown().await;
    }

    async fn ensure_adapter(&self) -> ScanResult<()> {
        if self.platform.has_adapter().await {
            Ok(())
        } else {
            Err(ScanError::NoBluetoothAdapter)
        }
    }

    fn claim_pending(&self) -> ScanResult<PendingScan<'_>> {
        self.pending_scan
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| PendingScan(&self.pending_scan))
            .map_err(|_| ScanError::ScanInProgress)
    }

    async fn ensure_enabled(&self) -> ScanResult<()> {
        if self.platform.is_enabled().await? {
            return Ok(());
        }
        info!("Bluetooth is disabled, asking the host to enable it");
        if self.platform.request_enable().await? && self.platform.is_enabled().await? {
            Ok(())
        } else {
            Err(ScanError::BluetoothDisabled)
        }
    }

    async fn ensure_permissions(&self) -> ScanResult<()> {
        if self.all_permissions_granted().await {
            return Ok(());
        }
        info!("Requesting Bluetooth permissions");
        if self.platform.request_permissions(&REQUIRED_PERMISSIONS).await
            && self.all_permissions_granted().await
        {
            Ok(())
        } else {
            Err(ScanError::NoPermission)
        }
    }

    async fn all_permissions_granted(&self) -> bool {
        for permission in REQUIRED_PERMISSIONS {
            if !self.platform.has_permission(permission).await {
                debug!("Missing permission {:?}", permission);
                return false;
            }
        }
        true
    }

    async fn ensure_location(&self) -> ScanResult<()> {
        if self.platform.is_location_enabled().await {
            return Ok(());
        }
        info!("Location service is off, asking the host to turn it on");
        if self.platform.request_location().await && self.platform.is_location_enabled().await {
            Ok(())
        } else {
            Err(ScanError::NoGps)
        }
    }

    // The receiver goes first so the finished event caused by the cancel is
    // not relayed on top of our own scan-stopped.
    async fn stop_discovery(&self) -> ScanResult<()> {
        self.unregister_receiver();
        let cancelled = self.platform.cancel_discovery().await;
        self.notify(Notification::ScanStopped);
        info!("Discovery stopped");
        cancelled
    }

    async fn register_receiver(&self) -> ScanResult<()> {
        let mut events = self.platform.events().await?;
        let id = self.next_receiver_id.fetch_add(1, Ordering::Relaxed);
        let slot = self.receiver.clone();
        let notifications = self.notifications.clone();

        // Held across the spawn so the relay cannot see the slot before it is filled.
        let mut current = lock_slot(&self.receiver);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let notification = match event {
                    PlatformEvent::DeviceFound(device) => {
                        Notification::NewDeviceFound(DeviceRecord::from(&device))
                    }
                    PlatformEvent::DiscoveryFinished => Notification::ScanStopped,
                };
                let active = lock_slot(&slot);
                if active.as_ref().map(|r| r.id) != Some(id) {
                    break;
                }
                notifications.send(notification);
            }
            debug!("Discovery receiver {id} finished");
        });
        if let Some(previous) = current.replace(Registration { id, task }) {
            previous.task.abort();
        }
        Ok(())
    }

    fn unregister_receiver(&self) {
        if let Some(registration) = lock_slot(&self.receiver).take() {
            registration.task.abort();
        }
    }

    fn notify(&self, notification: Notification) {
        self.notifications.send(notification);
    }
}
