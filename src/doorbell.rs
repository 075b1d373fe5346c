//! Doorbell signalling across the processor boundary
//!
//! Each channel direction owns two hardware signal bits: one announcing
//! "write index moved" and one announcing "read index moved". The bits carry
//! no count; a single signal may stand for any number of queued advances, so
//! every delivery must re-read the shared indices rather than assume one
//! unit of progress.
//!
//! The raising side is an opaque collaborator behind [`DoorbellRaiser`]. The
//! receiving side registers callbacks on a [`DoorbellBridge`]; registration
//! is explicit and returns a handle, and an unregistered slot is a counted
//! state, never a null-pointer check.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::eventfd::{eventfd, EfdFlags},
    unistd::{read, write},
};
use tracing::{debug, warn};

use crate::error::{Result, ShmError};

/// Outgoing half of the doorbell: raise one hardware bit
///
/// Implementations must be non-blocking; a raise may be coalesced with
/// earlier raises of the same bit.
pub trait DoorbellRaiser: Send + Sync + fmt::Debug {
    /// Raise the given signal bit towards the remote side
    fn raise(&self, bit: u8) -> Result<()>;
}

/// A raiser that drops every signal, for rings driven by explicit polling
#[derive(Debug, Default)]
pub struct NullDoorbell;

impl DoorbellRaiser for NullDoorbell {
    fn raise(&self, _bit: u8) -> Result<()> {
        Ok(())
    }
}

/// Which of a channel's two signals a registration refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellSignal {
    /// The producer advanced the write index
    DataWritten,
    /// The consumer advanced the read index
    BufferReleased,
}

/// Handle returned by a callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellRegistration {
    signal: DoorbellSignal,
    id: u64,
}

/// Callback invoked on delivery; the argument is the "more data follows"
/// hint (conservatively `false` when the hardware did not provide one)
pub type DoorbellCallback = Arc<dyn Fn(bool) + Send + Sync>;

enum CallbackSlot {
    /// No callback registered yet; deliveries are counted and dropped
    Vacant { missed: u64 },
    Registered { id: u64, callback: DoorbellCallback },
}

impl CallbackSlot {
    fn missed(&self) -> u64 {
        match self {
            CallbackSlot::Vacant { missed } => *missed,
            CallbackSlot::Registered { .. } => 0,
        }
    }
}

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackSlot::Vacant { missed } => {
                f.debug_struct("Vacant").field("missed", missed).finish()
            }
            CallbackSlot::Registered { id, .. } => {
                f.debug_struct("Registered").field("id", id).finish()
            }
        }
    }
}

/// Incoming half of the doorbell for one channel direction
#[derive(Debug)]
pub struct DoorbellBridge {
    data_written: Mutex<CallbackSlot>,
    buffer_released: Mutex<CallbackSlot>,
    next_id: Mutex<u64>,
}

impl DoorbellBridge {
    /// Create a bridge with both callback slots vacant
    pub fn new() -> Self {
        Self {
            data_written: Mutex::new(CallbackSlot::Vacant { missed: 0 }),
            buffer_released: Mutex::new(CallbackSlot::Vacant { missed: 0 }),
            next_id: Mutex::new(1),
        }
    }

    fn slot(&self, signal: DoorbellSignal) -> &Mutex<CallbackSlot> {
        match signal {
            DoorbellSignal::DataWritten => &self.data_written,
            DoorbellSignal::BufferReleased => &self.buffer_released,
        }
    }

    /// Register a callback for one signal, replacing any earlier one
    pub fn register(&self, signal: DoorbellSignal, callback: DoorbellCallback) -> DoorbellRegistration {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let mut slot = self.slot(signal).lock().unwrap();
        if let CallbackSlot::Vacant { missed } = &*slot {
            if *missed > 0 {
                debug!(missed = *missed, ?signal, "doorbell callback registered after missed deliveries");
            }
        }
        *slot = CallbackSlot::Registered { id, callback };
        DoorbellRegistration { signal, id }
    }

    /// Remove a registration; fails if the handle is stale
    pub fn unregister(&self, registration: DoorbellRegistration) -> Result<()> {
        let mut slot = self.slot(registration.signal).lock().unwrap();
        match &*slot {
            CallbackSlot::Registered { id, .. } if *id == registration.id => {
                *slot = CallbackSlot::Vacant { missed: 0 };
                Ok(())
            }
            _ => Err(ShmError::invalid_config(
                "registration",
                "doorbell registration is stale",
            )),
        }
    }

    /// Deliver a signal; `more` is the "more data immediately follows" hint
    ///
    /// Delivery into a vacant slot is counted and dropped; the indices in
    /// the shared region still carry the progress, so a late registrant
    /// loses nothing as long as it re-reads them.
    pub fn deliver(&self, signal: DoorbellSignal, more: bool) {
        // Clone the callback out of the lock: it may re-enter the bridge
        // (e.g. unregistering itself on a remote-close edge)
        let callback = {
            let mut slot = self.slot(signal).lock().unwrap();
            match &mut *slot {
                CallbackSlot::Vacant { missed } => {
                    *missed += 1;
                    debug!(?signal, "doorbell delivered before registration");
                    return;
                }
                CallbackSlot::Registered { callback, .. } => callback.clone(),
            }
        };
        callback(more);
    }

    /// Deliveries dropped while the slot for `signal` was vacant
    pub fn missed(&self, signal: DoorbellSignal) -> u64 {
        self.slot(signal).lock().unwrap().missed()
    }
}

impl Default for DoorbellBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Eventfd-backed doorbell for same-host loopback
///
/// Maps each signal bit onto its own eventfd, raised by writing and drained
/// by reading. Useful for exercising the full protocol between two threads
/// or processes on one host without hardware signal bits.
#[derive(Debug)]
pub struct EventfdDoorbell {
    fds: HashMap<u8, OwnedFd>,
}

impl EventfdDoorbell {
    /// Create a doorbell handling the given signal bits
    pub fn new(bits: &[u8]) -> Result<Self> {
        let mut fds = HashMap::new();
        for &bit in bits {
            let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| ShmError::from_io(e.into(), "Failed to create eventfd"))?;
            fds.insert(bit, fd);
        }
        Ok(Self { fds })
    }

    /// Wait until at least one bit fires, returning the fired bits drained
    ///
    /// `timeout_ms` of `None` blocks indefinitely. An empty result means
    /// the wait timed out.
    pub fn wait(&self, timeout_ms: Option<u64>) -> Result<Vec<u8>> {
        let mut bits: Vec<u8> = self.fds.keys().copied().collect();
        bits.sort_unstable();

        let borrowed: Vec<BorrowedFd<'_>> = bits
            .iter()
            .map(|bit| unsafe { BorrowedFd::borrow_raw(self.fds[bit].as_raw_fd()) })
            .collect();
        let mut poll_fds: Vec<PollFd> = borrowed
            .iter()
            .map(|fd| PollFd::new(fd, PollFlags::POLLIN))
            .collect();

        // Clamp instead of truncating: a huge timeout must stay a timeout,
        // not turn into poll's negative "wait forever"
        let timeout = timeout_ms
            .map(|ms| ms.min(i32::MAX as u64) as i32)
            .unwrap_or(-1);
        match poll(&mut poll_fds, timeout) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => {
                let fired: Vec<u8> = poll_fds
                    .iter()
                    .zip(&bits)
                    .filter(|(pfd, _)| {
                        pfd.revents()
                            .map(|r| r.contains(PollFlags::POLLIN))
                            .unwrap_or(false)
                    })
                    .map(|(_, bit)| *bit)
                    .collect();
                for bit in &fired {
                    // Drain the counter so the next wait starts clean
                    let mut buf = [0u8; 8];
                    let _ = read(self.fds[bit].as_raw_fd(), &mut buf);
                }
                Ok(fired)
            }
            Err(e) => Err(ShmError::from_io(e.into(), "Failed to poll doorbell")),
        }
    }

    /// Raw fd for a bit, for external event loops
    pub fn bit_fd(&self, bit: u8) -> Option<RawFd> {
        self.fds.get(&bit).map(|fd| fd.as_raw_fd())
    }
}

impl DoorbellRaiser for EventfdDoorbell {
    fn raise(&self, bit: u8) -> Result<()> {
        let fd = self.fds.get(&bit).ok_or_else(|| {
            ShmError::invalid_config("bit", format!("no eventfd mapped for bit {}", bit))
        })?;
        let value: u64 = 1;
        match write(fd.as_raw_fd(), &value.to_ne_bytes()) {
            Ok(_) => Ok(()),
            // Counter saturated: the other side is already signalled
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => {
                warn!(bit, error = %e, "doorbell raise failed");
                Err(ShmError::from_io(e.into(), "Failed to raise doorbell"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delivery_before_registration_is_counted() {
        let bridge = DoorbellBridge::new();
        bridge.deliver(DoorbellSignal::DataWritten, false);
        bridge.deliver(DoorbellSignal::DataWritten, true);
        assert_eq!(bridge.missed(DoorbellSignal::DataWritten), 2);
        assert_eq!(bridge.missed(DoorbellSignal::BufferReleased), 0);
    }

    #[test]
    fn test_registered_callback_receives_more_hint() {
        let bridge = DoorbellBridge::new();
        let hints = Arc::new(AtomicU32::new(0));
        let hints_cb = hints.clone();
        bridge.register(
            DoorbellSignal::DataWritten,
            Arc::new(move |more| {
                hints_cb.fetch_add(if more { 10 } else { 1 }, Ordering::Relaxed);
            }),
        );
        bridge.deliver(DoorbellSignal::DataWritten, true);
        bridge.deliver(DoorbellSignal::DataWritten, false);
        assert_eq!(hints.load(Ordering::Relaxed), 11);
        assert_eq!(bridge.missed(DoorbellSignal::DataWritten), 0);
    }

    #[test]
    fn test_unregister_restores_vacant_state() {
        let bridge = DoorbellBridge::new();
        let reg = bridge.register(DoorbellSignal::BufferReleased, Arc::new(|_| {}));
        bridge.unregister(reg).unwrap();
        bridge.deliver(DoorbellSignal::BufferReleased, false);
        assert_eq!(bridge.missed(DoorbellSignal::BufferReleased), 1);

        // The handle is now stale
        assert!(bridge.unregister(reg).is_err());
    }

    #[test]
    fn test_stale_handle_after_replacement() {
        let bridge = DoorbellBridge::new();
        let first = bridge.register(DoorbellSignal::DataWritten, Arc::new(|_| {}));
        let second = bridge.register(DoorbellSignal::DataWritten, Arc::new(|_| {}));
        assert!(bridge.unregister(first).is_err());
        bridge.unregister(second).unwrap();
    }

    #[test]
    fn test_eventfd_doorbell_raise_and_wait() {
        let bell = EventfdDoorbell::new(&[0, 1]).unwrap();
        bell.raise(1).unwrap();
        let fired = bell.wait(Some(100)).unwrap();
        assert_eq!(fired, vec![1]);

        // Drained: a second wait times out
        let fired = bell.wait(Some(10)).unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn test_eventfd_doorbell_coalesces() {
        let bell = EventfdDoorbell::new(&[3]).unwrap();
        bell.raise(3).unwrap();
        bell.raise(3).unwrap();
        bell.raise(3).unwrap();
        // Coalesced into one wakeup
        assert_eq!(bell.wait(Some(100)).unwrap(), vec![3]);
        assert!(bell.wait(Some(10)).unwrap().is_empty());
    }

    #[test]
    fn test_eventfd_wait_with_oversized_timeout() {
        let bell = EventfdDoorbell::new(&[0]).unwrap();
        bell.raise(0).unwrap();
        // A timeout beyond i32 range must still behave as a bounded wait
        let fired = bell.wait(Some(u64::MAX)).unwrap();
        assert_eq!(fired, vec![0]);
    }

    #[test]
    fn test_eventfd_doorbell_unknown_bit() {
        let bell = EventfdDoorbell::new(&[0]).unwrap();
        assert!(bell.raise(7).is_err());
    }

    #[test]
    fn test_null_doorbell() {
        NullDoorbell.raise(0).unwrap();
    }
}
