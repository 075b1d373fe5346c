//! Registry of duplex devices
//!
//! Membership here is the sole authority for "this device exists": doorbell
//! deliveries are routed by handle and refused for anything not registered.
//! The registry also enforces exclusivity groups at open time and drives
//! the bulk teardown sequence at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::device::DeviceConfig;
use crate::doorbell::{DoorbellRaiser, DoorbellSignal};
use crate::error::{Result, ShmError};
use crate::lifecycle::{DeviceHandle, DeviceState, DuplexDevice, TransportEvents};
use crate::readiness::ReadinessGate;
use crate::region::SharedRegion;

/// Poll interval while waiting for close confirmations at teardown
const TEARDOWN_POLL: Duration = Duration::from_millis(1);

/// The set of registered duplex devices
pub struct TransportRegistry {
    devices: RwLock<HashMap<DeviceHandle, Arc<DuplexDevice>>>,
    names: RwLock<HashMap<String, DeviceHandle>>,
    next_handle: AtomicU32,
    gate: Arc<ReadinessGate>,
    /// Serializes open/close decisions so two opens cannot both pass the
    /// exclusivity scan
    lifecycle_lock: Mutex<()>,
}

impl TransportRegistry {
    /// Create an empty registry gated on `gate`
    pub fn new(gate: Arc<ReadinessGate>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            gate,
            lifecycle_lock: Mutex::new(()),
        }
    }

    /// The readiness gate devices in this registry are checked against
    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }

    /// Register a device; its lifecycle starts in Closed
    ///
    /// The registration collaborator supplies the backing `region` and the
    /// outgoing `doorbell`, and is responsible for the mapping being valid
    /// before `open` is called.
    pub fn register(
        &self,
        config: DeviceConfig,
        region: Arc<SharedRegion>,
        doorbell: Arc<dyn DoorbellRaiser>,
        events: Arc<dyn TransportEvents>,
    ) -> Result<DeviceHandle> {
        config.validate(region.size())?;

        let mut names = self.names.write().unwrap();
        if names.contains_key(&config.name) {
            return Err(ShmError::duplicate_name(&config.name));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let name = config.name.clone();
        let device = Arc::new(DuplexDevice::new(handle, config, region, doorbell, events)?);

        names.insert(name.clone(), handle);
        self.devices.write().unwrap().insert(handle, device);
        debug!(device = %name, handle, "device registered");
        Ok(handle)
    }

    /// Remove a device; only permitted once it is Closed with no close
    /// acknowledgement outstanding
    pub fn unregister(&self, handle: DeviceHandle) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().unwrap();
        let device = self.device(handle)?;
        if device.state() != DeviceState::Closed || device.close_pending() {
            return Err(ShmError::device_busy(
                device.name(),
                device.state().to_string(),
            ));
        }
        self.names.write().unwrap().remove(device.name());
        self.devices.write().unwrap().remove(&handle);
        Ok(())
    }

    /// Look up a registered device
    pub fn device(&self, handle: DeviceHandle) -> Result<Arc<DuplexDevice>> {
        self.devices
            .read()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(ShmError::NotRegistered { handle })
    }

    /// Look up a device handle by name
    pub fn handle_by_name(&self, name: &str) -> Option<DeviceHandle> {
        self.names.read().unwrap().get(name).copied()
    }

    /// Number of registered devices
    pub fn device_count(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    /// Open a device, enforcing exclusivity groups
    ///
    /// Devices sharing an exclusivity group are mutually exclusive: at
    /// most one of them may be out of Closed at a time.
    pub fn open(&self, handle: DeviceHandle) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().unwrap();
        let device = self.device(handle)?;

        let group = device.config().exclusivity_group;
        let devices = self.devices.read().unwrap();
        for other in devices.values() {
            if other.handle() != handle
                && other.config().exclusivity_group == group
                && other.state() != DeviceState::Closed
            {
                return Err(ShmError::resource_conflict(other.name(), group));
            }
        }
        drop(devices);

        device.open(&self.gate)
    }

    /// Close a device
    pub fn close(&self, handle: DeviceHandle) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().unwrap();
        self.device(handle)?.close()
    }

    /// Route a data-written doorbell to a device
    ///
    /// `more` is the "more data immediately follows" hint; pass `false`
    /// when the hardware did not provide one.
    pub fn deliver_data_written(&self, handle: DeviceHandle, more: bool) -> Result<()> {
        let device = self.device(handle).map_err(|e| {
            warn!(handle, "doorbell for unregistered device dropped");
            e
        })?;
        device.bridge().deliver(DoorbellSignal::DataWritten, more);
        Ok(())
    }

    /// Route a buffer-released doorbell to a device
    pub fn deliver_buffer_released(&self, handle: DeviceHandle, more: bool) -> Result<()> {
        let device = self.device(handle).map_err(|e| {
            warn!(handle, "doorbell for unregistered device dropped");
            e
        })?;
        device.bridge().deliver(DoorbellSignal::BufferReleased, more);
        Ok(())
    }

    /// Devices whose open or close handshake has been outstanding longer
    /// than `timeout`
    pub fn stalled(&self, timeout: Duration) -> Vec<DeviceHandle> {
        self.devices
            .read()
            .unwrap()
            .values()
            .filter(|d| d.is_stalled(timeout))
            .map(|d| d.handle())
            .collect()
    }

    /// Best-effort transition of every device toward Closed
    ///
    /// Devices that do not confirm closure within `deadline` are forcibly
    /// marked Closed. Used at shutdown; does not block past the deadline.
    pub fn close_all(&self, deadline: Duration) {
        {
            let _guard = self.lifecycle_lock.lock().unwrap();
            let devices = self.devices.read().unwrap();
            for device in devices.values() {
                match device.close() {
                    Ok(()) => {}
                    Err(ShmError::AlreadyClosed { .. }) => {}
                    Err(e) => warn!(device = %device.name(), error = %e, "close failed at teardown"),
                }
            }
        }

        let start = Instant::now();
        loop {
            let pending: Vec<Arc<DuplexDevice>> = self
                .devices
                .read()
                .unwrap()
                .values()
                .filter(|d| d.close_pending())
                .cloned()
                .collect();
            if pending.is_empty() {
                return;
            }
            if start.elapsed() >= deadline {
                for device in pending {
                    warn!(device = %device.name(), "close unconfirmed at deadline, forcing Closed");
                    device.force_closed();
                }
                return;
            }
            thread::sleep(TEARDOWN_POLL);
        }
    }

    /// Unregister every device; only meaningful after [`close_all`]
    ///
    /// [`close_all`]: TransportRegistry::close_all
    pub fn remove_all(&self) {
        let _guard = self.lifecycle_lock.lock().unwrap();
        let mut devices = self.devices.write().unwrap();
        for device in devices.values() {
            if device.state() != DeviceState::Closed {
                warn!(device = %device.name(), "removing device that is not Closed");
                device.force_closed();
            }
        }
        devices.clear();
        self.names.write().unwrap().clear();
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("devices", &self.device_count())
            .finish()
    }
}
