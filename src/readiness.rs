//! Process-wide readiness gating for the physical transport
//!
//! The link layer signals twice during bring-up: once when the raw shared
//! memory link is usable and once when the dependent packet protocol layer
//! on top of it is. Both are one-shot, monotonic flags; nothing may open a
//! device before the flags it requires are set. The flags are explicit
//! objects passed by reference, not ambient globals.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::device::FramingMode;
use crate::error::{Result, ShmError};

/// A construct-once, set-once, read-many flag
#[derive(Debug, Default)]
pub struct ReadyFlag {
    ready: AtomicBool,
}

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag; further calls are no-ops
    pub fn set(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// The pair of readiness flags the transport depends on
#[derive(Debug, Default)]
pub struct ReadinessGate {
    link_ready: ReadyFlag,
    protocol_ready: ReadyFlag,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hardware link layer became usable
    pub fn set_link_ready(&self) {
        self.link_ready.set();
    }

    /// The dependent protocol layer became usable
    pub fn set_protocol_ready(&self) {
        self.protocol_ready.set();
    }

    pub fn link_ready(&self) -> bool {
        self.link_ready.is_set()
    }

    pub fn protocol_ready(&self) -> bool {
        self.protocol_ready.is_set()
    }

    /// Check the flags a device in `mode` requires before opening
    ///
    /// Stream devices talk straight over the link; Packet devices also run
    /// the dependent protocol layer and need both flags.
    pub fn check_for(&self, mode: FramingMode) -> Result<()> {
        if !self.link_ready() {
            return Err(ShmError::not_ready("shared memory link is not ready"));
        }
        if mode == FramingMode::Packet && !self.protocol_ready() {
            return Err(ShmError::not_ready("packet protocol layer is not ready"));
        }
        Ok(())
    }

    /// Drop both flags; only meaningful during full shutdown
    pub fn reset(&self) {
        self.link_ready.ready.store(false, Ordering::Release);
        self.protocol_ready.ready.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_start_unset() {
        let gate = ReadinessGate::new();
        assert!(!gate.link_ready());
        assert!(!gate.protocol_ready());
        assert!(gate.check_for(FramingMode::Stream).is_err());
    }

    #[test]
    fn test_set_is_monotonic() {
        let flag = ReadyFlag::new();
        flag.set();
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn test_stream_requires_only_link() {
        let gate = ReadinessGate::new();
        gate.set_link_ready();
        gate.check_for(FramingMode::Stream).unwrap();
        assert!(matches!(
            gate.check_for(FramingMode::Packet),
            Err(ShmError::NotReady { .. })
        ));
    }

    #[test]
    fn test_packet_requires_both() {
        let gate = ReadinessGate::new();
        gate.set_link_ready();
        gate.set_protocol_ready();
        gate.check_for(FramingMode::Packet).unwrap();
    }

    #[test]
    fn test_reset() {
        let gate = ReadinessGate::new();
        gate.set_link_ready();
        gate.reset();
        assert!(!gate.link_ready());
    }
}
