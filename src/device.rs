//! Device and channel configuration
//!
//! A duplex device pairs one rx and one tx channel over the shared region.
//! The configuration here is the contract handed over by the registration
//! collaborator; [`DeviceConfig::validate`] is the single place that decides
//! whether a geometry is usable before any shared-memory access happens.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShmError};
use crate::layout::descriptor_size;

/// Maximum device name length in bytes
pub const MAX_NAME_LEN: usize = 16;

/// Channel framing semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramingMode {
    /// Each slot holds exactly one bounded message with an explicit length
    Packet,
    /// The ring is a continuous byte cursor; callers frame their own data
    Stream,
}

/// Priority class, consumed by a higher-layer scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Latency class, consumed by a higher-layer scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Latency {
    /// Bulk traffic, batching preferred
    Relaxed,
    /// Interactive traffic, deliver promptly
    Low,
}

impl Default for Latency {
    fn default() -> Self {
        Latency::Relaxed
    }
}

/// Geometry of one channel direction inside the shared region
///
/// Offsets are relative to the start of the backing region. The descriptor
/// block sits at `base_offset`; the slot data area follows it, aligned to
/// `alignment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Offset of the channel block within the shared region
    pub base_offset: usize,
    /// Number of buffer slots (Packet mode granularity)
    pub slot_count: u32,
    /// Size of the slot data area in bytes, covering all slots
    pub data_size: u32,
    /// Required byte alignment of the slot payload start
    pub alignment: u32,
    /// Maximum transfer unit per packet; Packet mode only
    pub mtu: u32,
    /// Maximum packets per slot; Packet mode only
    pub packets_per_slot: u32,
    /// Doorbell bit raised when the write index moves
    pub data_bit: u8,
    /// Doorbell bit raised when the read index moves
    pub release_bit: u8,
}

impl ChannelConfig {
    /// Bytes of slot data per slot in Packet mode
    pub fn slot_size(&self) -> u32 {
        if self.slot_count == 0 {
            0
        } else {
            self.data_size / self.slot_count
        }
    }

    /// Total bytes this channel occupies in the region, descriptor included
    pub fn span(&self, mode: FramingMode) -> usize {
        let desc = descriptor_size(self.slot_count, mode == FramingMode::Packet);
        let align = self.alignment.max(1) as usize;
        let data_start = (desc + align - 1) / align * align;
        data_start + self.data_size as usize
    }

    /// Offset of the slot data area relative to `base_offset`
    pub fn data_offset(&self, mode: FramingMode) -> usize {
        let desc = descriptor_size(self.slot_count, mode == FramingMode::Packet);
        let align = self.alignment.max(1) as usize;
        (desc + align - 1) / align * align
    }

    fn validate(&self, direction: &str, mode: FramingMode) -> Result<()> {
        if self.data_size == 0 {
            return Err(ShmError::invalid_config(
                format!("{direction}.data_size"),
                "channel data area must be non-empty",
            ));
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(ShmError::invalid_config(
                format!("{direction}.alignment"),
                "alignment must be a power of two",
            ));
        }
        match mode {
            FramingMode::Packet => {
                if self.slot_count == 0 {
                    return Err(ShmError::invalid_config(
                        format!("{direction}.slot_count"),
                        "packet channel needs at least one slot",
                    ));
                }
                if self.data_size % self.slot_count != 0 {
                    return Err(ShmError::invalid_config(
                        format!("{direction}.data_size"),
                        "data area must divide evenly into slots",
                    ));
                }
                if self.mtu == 0 || self.packets_per_slot == 0 {
                    return Err(ShmError::invalid_config(
                        format!("{direction}.mtu"),
                        "packet channel needs non-zero mtu and packets_per_slot",
                    ));
                }
                if self.mtu.saturating_mul(self.packets_per_slot) > self.slot_size() {
                    return Err(ShmError::invalid_config(
                        format!("{direction}.mtu"),
                        "mtu times packets_per_slot exceeds slot size",
                    ));
                }
            }
            FramingMode::Stream => {
                // slot_count, mtu and packets_per_slot are meaningless in
                // stream mode; accept whatever is there
            }
        }
        Ok(())
    }
}

/// Full configuration of one duplex device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bounded device identifier, unique per registry
    pub name: String,
    /// Framing mode shared by both directions
    pub mode: FramingMode,
    /// Devices sharing a group are mutually exclusive when open
    pub exclusivity_group: u32,
    /// Priority class for higher-layer scheduling
    pub priority: Priority,
    /// Latency class for higher-layer scheduling
    pub latency: Latency,
    /// Receive direction (remote producer, local consumer)
    pub rx: ChannelConfig,
    /// Transmit direction (local producer, remote consumer)
    pub tx: ChannelConfig,
}

impl DeviceConfig {
    /// Validate structural well-formedness and rx/tx consistency
    ///
    /// `region_size` is the size of the backing region the offsets refer to.
    pub fn validate(&self, region_size: usize) -> Result<()> {
        if self.name.is_empty() {
            return Err(ShmError::invalid_config("name", "device name cannot be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(ShmError::invalid_config(
                "name",
                format!("device name exceeds {} bytes", MAX_NAME_LEN),
            ));
        }

        self.rx.validate("rx", self.mode)?;
        self.tx.validate("tx", self.mode)?;

        let rx_span = self.rx.base_offset..self.rx.base_offset + self.rx.span(self.mode);
        let tx_span = self.tx.base_offset..self.tx.base_offset + self.tx.span(self.mode);

        if rx_span.end > region_size || tx_span.end > region_size {
            return Err(ShmError::invalid_config(
                "base_offset",
                "channel extends past the end of the shared region",
            ));
        }
        if rx_span.start < tx_span.end && tx_span.start < rx_span.end {
            return Err(ShmError::invalid_config(
                "base_offset",
                "rx and tx channel areas overlap",
            ));
        }
        Ok(())
    }
}
