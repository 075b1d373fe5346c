//! Device lifecycle: pairing two ring channels into one duplex endpoint
//!
//! A device moves Closed → Opening → Open → Active and back to Closed. The
//! open and close handshakes cross the processor boundary through the
//! per-channel state words and doorbell signals; the remote side's part of
//! a handshake always arrives asynchronously. Active is an observational
//! state derived from traffic counters, not a gate on any operation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::device::DeviceConfig;
use crate::doorbell::{DoorbellBridge, DoorbellRaiser, DoorbellRegistration, DoorbellSignal};
use crate::error::{Result, ShmError};
use crate::readiness::ReadinessGate;
use crate::region::SharedRegion;
use crate::ring::{ChannelRole, RingChannel};

/// Opaque identifier for a registered device
pub type DeviceHandle = u32;

/// Lifecycle state of a duplex device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not in use; the only state a device may be unregistered in
    Closed,
    /// Local open requested, remote confirmation outstanding
    Opening,
    /// Both sides open, no payload transferred yet
    Open,
    /// Open with payload traffic observed (diagnostic state)
    Active,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Closed => "Closed",
            DeviceState::Opening => "Opening",
            DeviceState::Open => "Open",
            DeviceState::Active => "Active",
        };
        f.write_str(name)
    }
}

/// Upward callbacks to the owning application
///
/// Delivered from doorbell context: implementations must only do index
/// bookkeeping inline and defer anything heavier.
pub trait TransportEvents: Send + Sync {
    /// The remote side confirmed the open handshake
    fn open_confirmed(&self, handle: DeviceHandle);
    /// The device reached Closed, remote- or local-initiated
    fn close_confirmed(&self, handle: DeviceHandle);
    /// The remote producer advanced the rx write index
    fn data_available(&self, handle: DeviceHandle, more: bool);
    /// The remote consumer advanced the tx read index
    fn buffer_released(&self, handle: DeviceHandle, more: bool);
}

/// One full-duplex logical endpoint: an rx/tx ring pair plus lifecycle
pub struct DuplexDevice {
    handle: DeviceHandle,
    config: DeviceConfig,
    rx: RingChannel,
    tx: RingChannel,
    /// Base state; Active is derived from traffic counters in [`state`]
    ///
    /// [`state`]: DuplexDevice::state
    base_state: Mutex<DeviceState>,
    /// Local close requested, remote acknowledgement outstanding
    close_pending: AtomicBool,
    /// When the current handshake started, for stall detection
    handshake_since: Mutex<Option<Instant>>,
    bridge: DoorbellBridge,
    registrations: Mutex<Vec<DoorbellRegistration>>,
    events: Arc<dyn TransportEvents>,
}

impl fmt::Debug for DuplexDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexDevice")
            .field("handle", &self.handle)
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl DuplexDevice {
    /// Build a device over `region`; the configuration must already have
    /// passed [`DeviceConfig::validate`]
    pub fn new(
        handle: DeviceHandle,
        config: DeviceConfig,
        region: Arc<SharedRegion>,
        doorbell: Arc<dyn DoorbellRaiser>,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self> {
        config.validate(region.size())?;

        let rx = RingChannel::new(
            region.clone(),
            &config.rx,
            config.mode,
            ChannelRole::Consumer,
            doorbell.clone(),
        )?;
        let tx = RingChannel::new(
            region,
            &config.tx,
            config.mode,
            ChannelRole::Producer,
            doorbell,
        )?;

        Ok(Self {
            handle,
            config,
            rx,
            tx,
            base_state: Mutex::new(DeviceState::Closed),
            close_pending: AtomicBool::new(false),
            handshake_since: Mutex::new(None),
            bridge: DoorbellBridge::new(),
            registrations: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Receive direction (local consumer)
    pub fn rx(&self) -> &RingChannel {
        &self.rx
    }

    /// Transmit direction (local producer)
    pub fn tx(&self) -> &RingChannel {
        &self.tx
    }

    /// Incoming doorbell bridge for this device
    pub fn bridge(&self) -> &DoorbellBridge {
        &self.bridge
    }

    /// Current lifecycle state
    ///
    /// A device that is Open and has transferred payload in either
    /// direction reports Active.
    pub fn state(&self) -> DeviceState {
        let base = *self.base_state.lock().unwrap();
        if base == DeviceState::Open
            && (self.tx.committed_count() > 0 || self.rx.released_count() > 0)
        {
            DeviceState::Active
        } else {
            base
        }
    }

    /// Begin the open handshake
    ///
    /// Allowed only from Closed and only once the readiness flags for the
    /// device's framing mode are set. Publishes the local open flag, arms
    /// the doorbell bridge and moves to Opening; the transition to Open
    /// happens when the remote confirmation arrives.
    pub fn open(self: &Arc<Self>, gate: &ReadinessGate) -> Result<()> {
        gate.check_for(self.config.mode)?;

        let mut state = self.base_state.lock().unwrap();
        if *state != DeviceState::Closed {
            return Err(ShmError::device_busy(&self.config.name, state.to_string()));
        }

        // The local side owns its tx descriptor; the remote producer owns rx
        self.tx.init_descriptor();
        self.tx.set_open(true);
        self.close_pending.store(false, Ordering::Release);

        self.arm_bridge();

        *state = DeviceState::Opening;
        *self.handshake_since.lock().unwrap() = Some(Instant::now());
        debug!(device = %self.config.name, "open handshake started");
        Ok(())
    }

    fn arm_bridge(self: &Arc<Self>) {
        let mut regs = self.registrations.lock().unwrap();

        let weak = Arc::downgrade(self);
        regs.push(self.bridge.register(
            DoorbellSignal::DataWritten,
            Arc::new(move |more| {
                if let Some(device) = Weak::upgrade(&weak) {
                    device.handle_data_written(more);
                }
            }),
        ));

        let weak = Arc::downgrade(self);
        regs.push(self.bridge.register(
            DoorbellSignal::BufferReleased,
            Arc::new(move |more| {
                if let Some(device) = Weak::upgrade(&weak) {
                    device.handle_buffer_released(more);
                }
            }),
        ));
    }

    fn disarm_bridge(&self) {
        let mut regs = self.registrations.lock().unwrap();
        for reg in regs.drain(..) {
            // A stale handle only means the slot was re-registered
            let _ = self.bridge.unregister(reg);
        }
    }

    /// Request closure
    ///
    /// Disarms local writes immediately and abandons any acquired slot.
    /// The state reads Closed from here on; `close_confirmed` fires once
    /// the remote side acknowledges. Fails with `AlreadyClosed` on a
    /// device already Closed.
    pub fn close(&self) -> Result<()> {
        let mut state = self.base_state.lock().unwrap();
        if *state == DeviceState::Closed {
            return Err(ShmError::already_closed(&self.config.name));
        }

        self.tx.disarm_writes();
        self.tx.set_open(false);
        *state = DeviceState::Closed;
        self.close_pending.store(true, Ordering::Release);
        *self.handshake_since.lock().unwrap() = Some(Instant::now());
        debug!(device = %self.config.name, "close requested");
        Ok(())
    }

    /// The remote side confirmed our open request
    ///
    /// Usually detected through the rx state word on a doorbell delivery;
    /// collaborators with a dedicated notification may call it directly.
    pub fn remote_open_confirmed(&self) {
        let mut state = self.base_state.lock().unwrap();
        if *state != DeviceState::Opening {
            debug!(device = %self.config.name, state = %state, "spurious open confirmation");
            return;
        }
        *state = DeviceState::Open;
        *self.handshake_since.lock().unwrap() = None;
        self.tx.arm_writes();
        drop(state);
        self.events.open_confirmed(self.handle);
    }

    /// The remote side acknowledged our close request
    pub fn remote_close_confirmed(&self) {
        if self.close_pending.swap(false, Ordering::AcqRel) {
            *self.handshake_since.lock().unwrap() = None;
            self.disarm_bridge();
            self.events.close_confirmed(self.handle);
        }
    }

    /// The remote side closed first
    ///
    /// Forces Closed regardless of pending traffic; any slot the local
    /// side had acquired but not committed is discarded.
    pub fn remote_close(&self) {
        let mut state = self.base_state.lock().unwrap();
        if *state == DeviceState::Closed && !self.close_pending.load(Ordering::Acquire) {
            return;
        }
        self.tx.disarm_writes();
        self.tx.set_open(false);
        *state = DeviceState::Closed;
        self.close_pending.store(false, Ordering::Release);
        *self.handshake_since.lock().unwrap() = None;
        drop(state);
        self.disarm_bridge();
        self.events.close_confirmed(self.handle);
    }

    /// Forcibly mark the device Closed without waiting for the remote
    ///
    /// Used by registry teardown when the close deadline expires.
    pub fn force_closed(&self) {
        let mut state = self.base_state.lock().unwrap();
        self.tx.disarm_writes();
        self.tx.set_open(false);
        *state = DeviceState::Closed;
        self.close_pending.store(false, Ordering::Release);
        *self.handshake_since.lock().unwrap() = None;
        drop(state);
        self.disarm_bridge();
    }

    /// Whether a handshake has been outstanding longer than `timeout`
    ///
    /// A stalled device is a fault for the owning application to act on;
    /// the core never retries handshakes.
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.handshake_since
            .lock()
            .unwrap()
            .map(|since| since.elapsed() > timeout)
            .unwrap_or(false)
    }

    /// Remote acknowledgement still outstanding after a local close
    pub fn close_pending(&self) -> bool {
        self.close_pending.load(Ordering::Acquire)
    }

    /// Data-written doorbell for the rx ring
    ///
    /// Only index bookkeeping happens here: the rx state word is re-read
    /// to catch open/close edges, then the data-available callback fires
    /// if payload is pending. A single delivery may stand for any number
    /// of remote advances.
    fn handle_data_written(&self, more: bool) {
        let peer_open = self.rx.peer_open();
        let state = *self.base_state.lock().unwrap();

        match state {
            DeviceState::Opening if peer_open => {
                self.remote_open_confirmed();
            }
            DeviceState::Open | DeviceState::Active if !peer_open => {
                warn!(device = %self.config.name, "remote side closed the channel");
                self.remote_close();
                return;
            }
            DeviceState::Closed => {
                if self.close_pending.load(Ordering::Acquire) && !peer_open {
                    self.remote_close_confirmed();
                }
                return;
            }
            _ => {}
        }

        if self.rx.pending() > 0 {
            self.events.data_available(self.handle, more);
        }
    }

    /// Buffer-released doorbell for the tx ring
    fn handle_buffer_released(&self, more: bool) {
        if *self.base_state.lock().unwrap() == DeviceState::Closed {
            return;
        }
        self.events.buffer_released(self.handle, more);
    }
}

/// An event sink that drops every notification
#[derive(Debug, Default)]
pub struct NullEvents;

impl TransportEvents for NullEvents {
    fn open_confirmed(&self, _handle: DeviceHandle) {}
    fn close_confirmed(&self, _handle: DeviceHandle) {}
    fn data_available(&self, _handle: DeviceHandle, _more: bool) {}
    fn buffer_released(&self, _handle: DeviceHandle, _more: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelConfig, FramingMode, Latency, Priority};
    use crate::doorbell::NullDoorbell;
    use crate::region::{BackingType, RegionConfig};

    fn test_region() -> Arc<SharedRegion> {
        Arc::new(
            SharedRegion::new(RegionConfig {
                name: "lifecycle_test".to_string(),
                size: 8192,
                #[cfg(target_os = "linux")]
                backing_type: BackingType::MemFd,
                #[cfg(not(target_os = "linux"))]
                backing_type: BackingType::FileBacked,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn channel(base_offset: usize, data_bit: u8, release_bit: u8) -> ChannelConfig {
        ChannelConfig {
            base_offset,
            slot_count: 4,
            data_size: 512,
            alignment: 8,
            mtu: 128,
            packets_per_slot: 1,
            data_bit,
            release_bit,
        }
    }

    fn device_config(name: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            mode: FramingMode::Packet,
            exclusivity_group: 0,
            priority: Priority::default(),
            latency: Latency::default(),
            rx: channel(0, 0, 1),
            tx: channel(2048, 2, 3),
        }
    }

    fn ready_gate() -> ReadinessGate {
        let gate = ReadinessGate::new();
        gate.set_link_ready();
        gate.set_protocol_ready();
        gate
    }

    fn make_device(region: &Arc<SharedRegion>) -> Arc<DuplexDevice> {
        Arc::new(
            DuplexDevice::new(
                1,
                device_config("modem0"),
                region.clone(),
                Arc::new(NullDoorbell),
                Arc::new(NullEvents),
            )
            .unwrap(),
        )
    }

    /// Play the remote producer on the device's rx channel
    fn remote_for(region: &Arc<SharedRegion>, cfg: &DeviceConfig) -> RingChannel {
        let remote = RingChannel::new(
            region.clone(),
            &cfg.rx,
            cfg.mode,
            ChannelRole::Producer,
            Arc::new(NullDoorbell),
        )
        .unwrap();
        remote.init_descriptor();
        remote.arm_writes();
        remote
    }

    #[test]
    fn test_open_requires_readiness() {
        let region = test_region();
        let device = make_device(&region);
        let gate = ReadinessGate::new();
        assert!(matches!(device.open(&gate), Err(ShmError::NotReady { .. })));
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_open_handshake() {
        let region = test_region();
        let device = make_device(&region);
        let remote = remote_for(&region, device.config());

        device.open(&ready_gate()).unwrap();
        assert_eq!(device.state(), DeviceState::Opening);

        // Writes are not armed until the handshake completes
        assert!(device.tx().acquire_write_slot().is_err());

        remote.set_open(true);
        device.bridge().deliver(DoorbellSignal::DataWritten, false);
        assert_eq!(device.state(), DeviceState::Open);

        let slot = device.tx().acquire_write_slot().unwrap();
        slot.commit(16).unwrap();
        assert_eq!(device.state(), DeviceState::Active);
    }

    #[test]
    fn test_open_twice_is_busy() {
        let region = test_region();
        let device = make_device(&region);
        device.open(&ready_gate()).unwrap();
        assert!(matches!(
            device.open(&ready_gate()),
            Err(ShmError::DeviceBusy { .. })
        ));
    }

    #[test]
    fn test_close_idempotence() {
        let region = test_region();
        let device = make_device(&region);
        let remote = remote_for(&region, device.config());

        device.open(&ready_gate()).unwrap();
        remote.set_open(true);
        device.bridge().deliver(DoorbellSignal::DataWritten, false);

        device.close().unwrap();
        assert_eq!(device.state(), DeviceState::Closed);
        assert!(device.close_pending());

        assert!(matches!(device.close(), Err(ShmError::AlreadyClosed { .. })));

        device.remote_close_confirmed();
        assert!(!device.close_pending());
    }

    #[test]
    fn test_close_abandons_acquired_slot() {
        let region = test_region();
        let device = make_device(&region);
        let remote = remote_for(&region, device.config());

        device.open(&ready_gate()).unwrap();
        remote.set_open(true);
        device.bridge().deliver(DoorbellSignal::DataWritten, false);

        let mut slot = device.tx().acquire_write_slot().unwrap();
        slot.write_payload(b"doomed").unwrap();
        device.close().unwrap();

        // Commit after close is refused; the payload is never published
        assert!(slot.commit(6).is_err());
        assert_eq!(device.tx().committed_count(), 0);
    }

    #[test]
    fn test_remote_initiated_close() {
        let region = test_region();
        let device = make_device(&region);
        let remote = remote_for(&region, device.config());

        device.open(&ready_gate()).unwrap();
        remote.set_open(true);
        device.bridge().deliver(DoorbellSignal::DataWritten, false);
        assert_eq!(device.state(), DeviceState::Open);

        // Peer drops its open flag and rings the bell
        remote.set_open(false);
        device.bridge().deliver(DoorbellSignal::DataWritten, false);
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_stall_detection() {
        let region = test_region();
        let device = make_device(&region);
        device.open(&ready_gate()).unwrap();
        assert!(!device.is_stalled(Duration::from_secs(60)));
        assert!(device.is_stalled(Duration::ZERO));
    }

    #[test]
    fn test_force_closed() {
        let region = test_region();
        let device = make_device(&region);
        device.open(&ready_gate()).unwrap();
        device.force_closed();
        assert_eq!(device.state(), DeviceState::Closed);
        assert!(!device.close_pending());
    }
}
