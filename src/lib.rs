//! # shmlink - Shared-Memory Channel Transport
//!
//! shmlink is a zero-copy inter-processor communication transport over a
//! region of physically shared memory connecting a host processor and a
//! remote peer (typically a modem). Payloads move through fixed ring
//! channels addressed purely by index words written into the shared region;
//! hardware doorbell bits cross the processor boundary instead of polling.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                 Transport Registry                    │
//! │  register / open / close / close_all / doorbells      │
//! ├───────────────────────────────────────────────────────┤
//! │  Duplex Device (lifecycle)  │  Readiness Gate         │
//! │  Closed→Opening→Open→Active │  link / protocol flags  │
//! ├─────────────────────────────┴─────────────────────────┤
//! │  rx Ring Channel            │  tx Ring Channel        │
//! │  peek / release             │  acquire / commit       │
//! ├───────────────────────────────────────────────────────┤
//! │          Shared region (cross-processor ABI)          │
//! │   state / read / write words + slot table + payload   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! There are no locks across the boundary: each side writes exactly one
//! cursor per direction, and the doorbell bits only ever mean "re-read the
//! indices now".

pub mod device;
pub mod doorbell;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod readiness;
pub mod region;
pub mod registry;
pub mod ring;

// Main API re-exports
pub use device::{ChannelConfig, DeviceConfig, FramingMode, Latency, Priority, MAX_NAME_LEN};
pub use doorbell::{
    DoorbellBridge, DoorbellCallback, DoorbellRaiser, DoorbellRegistration, DoorbellSignal,
    EventfdDoorbell, NullDoorbell,
};
pub use error::{Result, ShmError};
pub use layout::{ChannelDescriptor, CHANNEL_CLOSED, CHANNEL_OPEN};
pub use lifecycle::{DeviceHandle, DeviceState, DuplexDevice, NullEvents, TransportEvents};
pub use readiness::{ReadinessGate, ReadyFlag};
pub use region::{BackingType, RegionConfig, SharedRegion};
pub use registry::TransportRegistry;
pub use ring::{ChannelRole, ReadSlot, RingChannel, WriteSlot};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    /// Default byte alignment for slot payload areas
    pub const DEFAULT_ALIGNMENT: u32 = 64;

    /// Default number of slots per packet-mode channel
    pub const DEFAULT_SLOT_COUNT: u32 = 4;

    /// Default teardown deadline for `close_all`
    pub const DEFAULT_TEARDOWN_DEADLINE_MS: u64 = 1000;
}
