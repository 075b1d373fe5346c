//! Unidirectional ring channel over the shared region
//!
//! One `RingChannel` is one direction of one device. The producer side
//! acquires a slot, writes its payload in place and commits; the consumer
//! side peeks the slot and releases it. The only shared mutable state is
//! the descriptor words in the region, and each side writes exactly one
//! cursor, so no locking across the processor boundary is possible or
//! needed. Cross-boundary notification happens through the doorbell bits,
//! never by polling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::{ChannelConfig, FramingMode};
use crate::doorbell::DoorbellRaiser;
use crate::error::{Result, ShmError};
use crate::layout::{
    advance_index, index_distance, ChannelDescriptor, CHANNEL_CLOSED, CHANNEL_OPEN,
};
use crate::region::SharedRegion;

/// Which side of the channel this view represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Writes payloads, advances the write index, owns the state word
    Producer,
    /// Reads payloads, advances the read index
    Consumer,
}

/// One direction of shared-memory transfer
#[derive(Debug)]
pub struct RingChannel {
    /// Keeps the mapping alive for as long as the raw pointers are used
    _region: Arc<SharedRegion>,
    desc: ChannelDescriptor,
    data: *mut u8,
    /// Slots in Packet mode, bytes in Stream mode
    capacity: u32,
    slot_size: u32,
    mtu: u32,
    mode: FramingMode,
    role: ChannelRole,
    data_bit: u8,
    release_bit: u8,
    doorbell: Arc<dyn DoorbellRaiser>,
    /// Gate armed by the device lifecycle; writes refused while false
    writes_armed: AtomicBool,
    /// An acquired slot exists that has not been committed or abandoned
    write_pending: AtomicBool,
    committed: AtomicU64,
    released: AtomicU64,
}

impl RingChannel {
    /// Map a channel view onto `region` at the offsets in `config`
    pub fn new(
        region: Arc<SharedRegion>,
        config: &ChannelConfig,
        mode: FramingMode,
        role: ChannelRole,
        doorbell: Arc<dyn DoorbellRaiser>,
    ) -> Result<Self> {
        let span = config.span(mode);
        if config.base_offset + span > region.size() {
            return Err(ShmError::invalid_config(
                "base_offset",
                "channel extends past the end of the shared region",
            ));
        }

        let base = unsafe { region.as_mut_ptr().add(config.base_offset) };
        let packet = mode == FramingMode::Packet;
        let desc = unsafe { ChannelDescriptor::from_raw(base, config.slot_count, packet)? };

        let data_offset = config.data_offset(mode);
        let data = unsafe { base.add(data_offset) };
        if config.alignment > 1 && (data as usize) % config.alignment as usize != 0 {
            return Err(ShmError::invalid_config(
                "alignment",
                "slot area is not aligned at its mapped address",
            ));
        }

        let capacity = match mode {
            FramingMode::Packet => config.slot_count,
            FramingMode::Stream => config.data_size,
        };

        Ok(Self {
            _region: region,
            desc,
            data,
            capacity,
            slot_size: config.slot_size(),
            mtu: config.mtu,
            mode,
            role,
            data_bit: config.data_bit,
            release_bit: config.release_bit,
            doorbell,
            writes_armed: AtomicBool::new(false),
            write_pending: AtomicBool::new(false),
            committed: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// Zero the descriptor words; called once by the side owning the region
    pub fn init_descriptor(&self) {
        self.desc.init();
    }

    /// Validate the descriptor written by the other side
    pub fn validate_descriptor(&self) -> Result<()> {
        self.desc.validate()
    }

    /// Channel capacity: slots in Packet mode, bytes in Stream mode
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Framing mode of this channel
    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Role of this channel view
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Unconsumed units between the two cursors
    pub fn pending(&self) -> u32 {
        index_distance(self.desc.write_index(), self.desc.read_index(), self.capacity)
    }

    /// Units the producer may still write before the channel is full
    pub fn free(&self) -> u32 {
        self.capacity - self.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn is_full(&self) -> bool {
        self.pending() == self.capacity
    }

    /// Successful commits on this view
    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Successful releases on this view
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    // --- lifecycle hooks -------------------------------------------------

    /// Permit writes; called when the owning device reaches Opening
    pub fn arm_writes(&self) {
        self.writes_armed.store(true, Ordering::Release);
    }

    /// Refuse all further writes and abandon any uncommitted slot
    pub fn disarm_writes(&self) {
        self.writes_armed.store(false, Ordering::Release);
        self.write_pending.store(false, Ordering::Release);
    }

    /// Publish the local open flag in the shared region (producer side)
    pub fn set_open(&self, open: bool) {
        self.desc
            .set_state(if open { CHANNEL_OPEN } else { CHANNEL_CLOSED });
    }

    /// Observe the remote side's open flag (consumer side)
    pub fn peer_open(&self) -> bool {
        self.desc.state() == CHANNEL_OPEN
    }

    // --- producer side ---------------------------------------------------

    /// Claim the next free slot for writing
    ///
    /// Fails with `ChannelFull` when the write index would overtake the
    /// read index. At most one slot may be outstanding; the slot is
    /// abandoned if dropped without committing.
    pub fn acquire_write_slot(&self) -> Result<WriteSlot<'_>> {
        if self.role != ChannelRole::Producer {
            return Err(ShmError::invalid_config(
                "role",
                "acquire_write_slot on a consumer channel",
            ));
        }
        if !self.writes_armed.load(Ordering::Acquire) {
            return Err(ShmError::not_ready("channel is not open for writing"));
        }
        if self.write_pending.swap(true, Ordering::AcqRel) {
            return Err(ShmError::device_busy("tx channel", "uncommitted write pending"));
        }

        let write = self.desc.write_index();
        let read = self.desc.read_index();
        let used = index_distance(write, read, self.capacity);

        let (ptr, budget) = match self.mode {
            FramingMode::Packet => {
                if used >= self.capacity {
                    self.write_pending.store(false, Ordering::Release);
                    return Err(ShmError::channel_full(used, self.capacity));
                }
                let slot = write % self.capacity;
                let ptr = unsafe { self.data.add((slot * self.slot_size) as usize) };
                (ptr, self.mtu)
            }
            FramingMode::Stream => {
                let free = self.capacity - used;
                if free == 0 {
                    self.write_pending.store(false, Ordering::Release);
                    return Err(ShmError::channel_full(used, self.capacity));
                }
                let offset = write % self.capacity;
                // Budget is the contiguous run up to the wrap point
                let run = free.min(self.capacity - offset);
                let ptr = unsafe { self.data.add(offset as usize) };
                (ptr, run)
            }
        };

        Ok(WriteSlot {
            channel: self,
            index: write,
            ptr,
            budget,
        })
    }

    fn commit_from(&self, index: u32, budget: u32, len: u32) -> Result<()> {
        if !self.writes_armed.load(Ordering::Acquire) {
            return Err(ShmError::not_ready("channel is not open for writing"));
        }
        if len == 0 {
            return Err(ShmError::invalid_config("len", "zero-length commit"));
        }
        if len > budget {
            return Err(ShmError::payload_too_large(len, budget));
        }
        debug_assert_eq!(index, self.desc.write_index());

        match self.mode {
            FramingMode::Packet => {
                self.desc.set_slot_size(index % self.capacity, len)?;
                self.desc
                    .store_write_index(advance_index(index, 1, self.capacity));
            }
            FramingMode::Stream => {
                self.desc
                    .store_write_index(advance_index(index, len, self.capacity));
            }
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.doorbell.raise(self.data_bit)
    }

    // --- consumer side ---------------------------------------------------

    /// Look at the payload at the read index without consuming it
    ///
    /// Returns `None` when the channel is empty. In Stream mode the slot
    /// covers the contiguous unread run up to the wrap point.
    pub fn peek_read_slot(&self) -> Result<Option<ReadSlot<'_>>> {
        if self.role != ChannelRole::Consumer {
            return Err(ShmError::invalid_config(
                "role",
                "peek_read_slot on a producer channel",
            ));
        }
        let read = self.desc.read_index();
        let write = self.desc.write_index();
        let available = index_distance(write, read, self.capacity);
        if available == 0 {
            return Ok(None);
        }

        match self.mode {
            FramingMode::Packet => {
                let slot = read % self.capacity;
                let len = self.desc.slot_size(slot)?;
                if len == 0 || len > self.slot_size {
                    // Remote wrote a size outside the agreed bounds
                    return Err(ShmError::invalid_config(
                        "slot_size",
                        "remote slot size outside slot bounds",
                    ));
                }
                let ptr = unsafe { self.data.add((slot * self.slot_size) as usize) };
                Ok(Some(ReadSlot {
                    channel: self,
                    index: read,
                    ptr,
                    len,
                    advance: 1,
                }))
            }
            FramingMode::Stream => {
                let offset = read % self.capacity;
                let run = available.min(self.capacity - offset);
                let ptr = unsafe { self.data.add(offset as usize) };
                Ok(Some(ReadSlot {
                    channel: self,
                    index: read,
                    ptr,
                    len: run,
                    advance: run,
                }))
            }
        }
    }

    /// Release the slot at the read index without peeking it first
    ///
    /// Advances one slot in Packet mode or the contiguous unread run in
    /// Stream mode, then raises the buffer-released bit.
    pub fn release_read_slot(&self) -> Result<()> {
        if self.role != ChannelRole::Consumer {
            return Err(ShmError::invalid_config(
                "role",
                "release_read_slot on a producer channel",
            ));
        }
        let read = self.desc.read_index();
        let write = self.desc.write_index();
        let available = index_distance(write, read, self.capacity);
        if available == 0 {
            return Err(ShmError::NothingToRelease);
        }
        let advance = match self.mode {
            FramingMode::Packet => 1,
            FramingMode::Stream => available.min(self.capacity - read % self.capacity),
        };
        self.release_from(read, advance)
    }

    fn release_from(&self, index: u32, advance: u32) -> Result<()> {
        if index != self.desc.read_index() {
            // Stale slot: the cursor already moved past it
            return Err(ShmError::NothingToRelease);
        }
        self.desc
            .store_read_index(advance_index(index, advance, self.capacity));
        self.released.fetch_add(1, Ordering::Relaxed);
        self.doorbell.raise(self.release_bit)
    }
}

// The raw pointers target the mapped region owned by `_region`; the index
// discipline keeps producer and consumer on disjoint bytes.
unsafe impl Send for RingChannel {}
unsafe impl Sync for RingChannel {}

/// An acquired, not yet committed write slot
///
/// Dropping the slot abandons it: the write index never advances and the
/// consumer never observes the bytes.
#[derive(Debug)]
pub struct WriteSlot<'a> {
    channel: &'a RingChannel,
    index: u32,
    ptr: *mut u8,
    budget: u32,
}

impl<'a> WriteSlot<'a> {
    /// Bytes the payload may occupy
    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// The writable payload area
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.budget as usize) }
    }

    /// Copy `payload` into the slot; fails without side effects when it
    /// exceeds the budget
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() as u32 > self.budget {
            return Err(ShmError::payload_too_large(payload.len() as u32, self.budget));
        }
        self.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Record the payload length, advance the write index and raise the
    /// data-written doorbell bit
    pub fn commit(self, len: u32) -> Result<()> {
        self.channel.commit_from(self.index, self.budget, len)
        // Drop clears the pending flag
    }

    /// Explicitly abandon the slot
    pub fn abandon(self) {}
}

impl<'a> Drop for WriteSlot<'a> {
    fn drop(&mut self) {
        self.channel.write_pending.store(false, Ordering::Release);
    }
}

/// A peeked, not yet released read slot
#[derive(Debug)]
pub struct ReadSlot<'a> {
    channel: &'a RingChannel,
    index: u32,
    ptr: *const u8,
    len: u32,
    advance: u32,
}

impl<'a> ReadSlot<'a> {
    /// Payload length in bytes
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The payload bytes; owned by the consumer until released
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }

    /// Advance the read index past this slot and raise the
    /// buffer-released doorbell bit
    pub fn release(self) -> Result<()> {
        self.channel.release_from(self.index, self.advance)
    }
}
