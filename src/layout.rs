//! Shared-region byte layout for channel descriptors
//!
//! The shared memory region itself is the wire format between the two
//! processors. Each unidirectional channel owns a descriptor block of
//! little-endian 32-bit words at a fixed offset, followed in Packet mode by
//! a per-slot size table, followed by the slot data area:
//!
//! ```text
//! ┌──────────┬─────────┬───────┬──────┬───────┬──────────────┬───────────┐
//! │  magic   │ version │ state │ read │ write │ slot_size[N] │ data area │
//! └──────────┴─────────┴───────┴──────┴───────┴──────────────┴───────────┘
//! ```
//!
//! This layout is a cross-processor ABI: both sides must agree on it, and
//! any change requires coordinated versioning. All words are accessed as
//! atomics; the producer side writes only `write` (and the size table), the
//! consumer side writes only `read`.
//!
//! Read/write indices advance modulo **twice** the channel capacity, so
//! `write - read == 0` is unambiguously empty and `write - read == capacity`
//! unambiguously full. The physical slot (or byte offset) is the index
//! modulo the capacity itself.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, ShmError};

/// Magic number identifying a channel descriptor ("SML1")
pub const DESCRIPTOR_MAGIC: u32 = 0x534d_4c31;

/// Descriptor schema version
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Channel `state` word: local side has opened the channel
pub const CHANNEL_OPEN: u32 = 1;

/// Channel `state` word: channel closed
pub const CHANNEL_CLOSED: u32 = 0;

/// Fixed descriptor words before the slot size table
const DESCRIPTOR_HEADER_WORDS: usize = 5;

const WORD: usize = std::mem::size_of::<u32>();

const MAGIC_WORD: usize = 0;
const VERSION_WORD: usize = 1;
const STATE_WORD: usize = 2;
const READ_WORD: usize = 3;
const WRITE_WORD: usize = 4;

/// Byte size of a channel descriptor block
///
/// `slot_count` is only consulted in Packet mode; a Stream descriptor
/// carries no size table.
pub fn descriptor_size(slot_count: u32, packet_mode: bool) -> usize {
    let table = if packet_mode { slot_count as usize } else { 0 };
    (DESCRIPTOR_HEADER_WORDS + table) * WORD
}

/// Advance an index within the doubled index range
#[inline]
pub fn advance_index(index: u32, by: u32, capacity: u32) -> u32 {
    debug_assert!(capacity > 0);
    let range = 2 * capacity as u64;
    ((index as u64 + by as u64) % range) as u32
}

/// Wraparound-safe distance from `read` to `write`
///
/// Both indices must lie in `[0, 2 * capacity)`. The capacity need not be
/// a power of two, so the subtraction cannot lean on u32 wrapping; the
/// wrap is resolved over the doubled range instead. The result is the
/// number of unconsumed units, in `[0, capacity]`.
#[inline]
pub fn index_distance(write: u32, read: u32, capacity: u32) -> u32 {
    debug_assert!(capacity > 0);
    if write >= read {
        write - read
    } else {
        let range = 2 * capacity as u64;
        (range - (read - write) as u64) as u32
    }
}

/// Atomic view over one channel's descriptor words in the shared region
///
/// The struct holds raw pointers into the mapped region; the owning
/// [`RingChannel`](crate::ring::RingChannel) keeps the mapping alive.
#[derive(Debug)]
pub struct ChannelDescriptor {
    words: *const AtomicU32,
    slot_table_len: u32,
}

impl ChannelDescriptor {
    /// Map a descriptor onto `base`.
    ///
    /// # Safety
    /// `base` must point at a 4-byte aligned, live allocation of at least
    /// [`descriptor_size`] bytes that outlives the descriptor, and no
    /// non-atomic access to those bytes may occur while it is in use.
    pub unsafe fn from_raw(base: *mut u8, slot_count: u32, packet_mode: bool) -> Result<Self> {
        if base.is_null() {
            return Err(ShmError::invalid_config("base", "descriptor base is null"));
        }
        if base as usize % WORD != 0 {
            return Err(ShmError::invalid_config(
                "base",
                "descriptor base must be 4-byte aligned",
            ));
        }
        Ok(Self {
            words: base as *const AtomicU32,
            slot_table_len: if packet_mode { slot_count } else { 0 },
        })
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicU32 {
        // Bounds are fixed at construction; slot indices are checked by
        // callers against slot_table_len.
        unsafe { &*self.words.add(index) }
    }

    /// Initialize the descriptor for a fresh channel
    ///
    /// Called once by the side that owns the region before any traffic.
    pub fn init(&self) {
        self.word(MAGIC_WORD)
            .store(DESCRIPTOR_MAGIC.to_le(), Ordering::Relaxed);
        self.word(VERSION_WORD)
            .store(DESCRIPTOR_VERSION.to_le(), Ordering::Relaxed);
        self.word(STATE_WORD)
            .store(CHANNEL_CLOSED.to_le(), Ordering::Relaxed);
        self.word(READ_WORD).store(0, Ordering::Relaxed);
        for i in 0..self.slot_table_len {
            self.word(DESCRIPTOR_HEADER_WORDS + i as usize)
                .store(0, Ordering::Relaxed);
        }
        // Publish the header before the write index becomes visible
        self.word(WRITE_WORD).store(0, Ordering::Release);
    }

    /// Validate magic and version words
    pub fn validate(&self) -> Result<()> {
        let magic = u32::from_le(self.word(MAGIC_WORD).load(Ordering::Acquire));
        if magic != DESCRIPTOR_MAGIC {
            return Err(ShmError::invalid_config("magic", "invalid descriptor magic"));
        }
        let version = u32::from_le(self.word(VERSION_WORD).load(Ordering::Relaxed));
        if version != DESCRIPTOR_VERSION {
            return Err(ShmError::invalid_config(
                "version",
                "unsupported descriptor version",
            ));
        }
        Ok(())
    }

    /// Read the channel state word
    pub fn state(&self) -> u32 {
        u32::from_le(self.word(STATE_WORD).load(Ordering::Acquire))
    }

    /// Write the channel state word
    pub fn set_state(&self, state: u32) {
        self.word(STATE_WORD).store(state.to_le(), Ordering::Release);
    }

    /// Load the read index (consumer cursor)
    pub fn read_index(&self) -> u32 {
        u32::from_le(self.word(READ_WORD).load(Ordering::Acquire))
    }

    /// Store the read index; only the consumer side may call this
    pub fn store_read_index(&self, value: u32) {
        self.word(READ_WORD).store(value.to_le(), Ordering::Release);
    }

    /// Load the write index (producer cursor)
    pub fn write_index(&self) -> u32 {
        u32::from_le(self.word(WRITE_WORD).load(Ordering::Acquire))
    }

    /// Store the write index; only the producer side may call this
    pub fn store_write_index(&self, value: u32) {
        self.word(WRITE_WORD).store(value.to_le(), Ordering::Release);
    }

    /// Read a packet-mode slot size
    pub fn slot_size(&self, slot: u32) -> Result<u32> {
        if slot >= self.slot_table_len {
            return Err(ShmError::invalid_config("slot", "slot index out of range"));
        }
        Ok(u32::from_le(
            self.word(DESCRIPTOR_HEADER_WORDS + slot as usize)
                .load(Ordering::Acquire),
        ))
    }

    /// Record a packet-mode slot size; set by the producer before the
    /// write index advances over the slot
    pub fn set_slot_size(&self, slot: u32, size: u32) -> Result<()> {
        if slot >= self.slot_table_len {
            return Err(ShmError::invalid_config("slot", "slot index out of range"));
        }
        self.word(DESCRIPTOR_HEADER_WORDS + slot as usize)
            .store(size.to_le(), Ordering::Release);
        Ok(())
    }
}

unsafe impl Send for ChannelDescriptor {}
unsafe impl Sync for ChannelDescriptor {}
