//! # Kernel Abstraction Traits
//!
//! Collaborators the IPC core consumes but does not implement: copying
//! messages in and out of process address spaces, and a monotonic clock for
//! notification timestamps. The embedding kernel supplies real
//! implementations; tests inject the mocks below.

use thiserror::Error;

use crate::ipc::Message;
use crate::types::{ProcNr, VirAddr};

/// Failure to move a message across an address-space boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CopyError {
    /// The buffer is not mapped in the process's address space
    #[error("buffer not mapped")]
    Unmapped,
    /// The buffer is mapped but not writable
    #[error("buffer not writable")]
    ReadOnly,
}

/// Address-space copy operations
pub trait AddressSpaceOps {
    /// Copy the message at `addr` out of `proc`'s address space
    fn read_message(&self, proc: ProcNr, addr: VirAddr) -> Result<Message, CopyError>;

    /// Copy `msg` into `proc`'s address space at `addr`. On failure the
    /// destination buffer is left untouched.
    fn write_message(&mut self, proc: ProcNr, addr: VirAddr, msg: &Message)
        -> Result<(), CopyError>;
}

/// Monotonic time source
pub trait ClockOps {
    /// Ticks since boot
    fn uptime(&self) -> u64;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use alloc::collections::{BTreeMap, BTreeSet};
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU64, Ordering};
    use spin::Mutex;

    /// Per-process message buffers keyed by `(process, address)`.
    ///
    /// Reads of a buffer that was never written yield a default message.
    pub struct MockMemory {
        buffers: BTreeMap<(ProcNr, VirAddr), Message>,
        faulty: BTreeSet<(ProcNr, VirAddr)>,
        /// Recorded successful writes
        pub writes: Mutex<Vec<(ProcNr, VirAddr)>>,
    }

    impl Default for MockMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockMemory {
        pub fn new() -> Self {
            Self {
                buffers: BTreeMap::new(),
                faulty: BTreeSet::new(),
                writes: Mutex::new(Vec::new()),
            }
        }

        /// Place `msg` in `proc`'s buffer at `addr`
        pub fn put(&mut self, proc: ProcNr, addr: VirAddr, msg: Message) {
            self.buffers.insert((proc, addr), msg);
        }

        /// Current content of `proc`'s buffer at `addr`
        pub fn peek(&self, proc: ProcNr, addr: VirAddr) -> Option<Message> {
            self.buffers.get(&(proc, addr)).copied()
        }

        /// Make every access to `proc`'s buffer at `addr` fail
        pub fn inject_fault(&mut self, proc: ProcNr, addr: VirAddr) {
            self.faulty.insert((proc, addr));
        }

        pub fn clear_fault(&mut self, proc: ProcNr, addr: VirAddr) {
            self.faulty.remove(&(proc, addr));
        }

        /// Number of successful writes so far
        pub fn write_count(&self) -> usize {
            self.writes.lock().len()
        }
    }

    impl AddressSpaceOps for MockMemory {
        fn read_message(&self, proc: ProcNr, addr: VirAddr) -> Result<Message, CopyError> {
            if self.faulty.contains(&(proc, addr)) {
                return Err(CopyError::Unmapped);
            }
            Ok(self.peek(proc, addr).unwrap_or_default())
        }

        fn write_message(
            &mut self,
            proc: ProcNr,
            addr: VirAddr,
            msg: &Message,
        ) -> Result<(), CopyError> {
            if self.faulty.contains(&(proc, addr)) {
                return Err(CopyError::ReadOnly);
            }
            self.buffers.insert((proc, addr), *msg);
            self.writes.lock().push((proc, addr));
            Ok(())
        }
    }

    /// Manually advanced clock
    #[derive(Default)]
    pub struct MockClock {
        now: AtomicU64,
    }

    impl MockClock {
        pub fn new(start: u64) -> Self {
            Self {
                now: AtomicU64::new(start),
            }
        }

        pub fn advance(&self, ticks: u64) {
            self.now.fetch_add(ticks, Ordering::Relaxed);
        }
    }

    impl ClockOps for MockClock {
        fn uptime(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
    }

    mod tests {
        use super::*;

        #[test]
        fn test_memory_roundtrip_and_faults() {
            let mut mem = MockMemory::new();
            let p = ProcNr::from_raw(4);
            let addr = VirAddr::new(0x1000);

            assert_eq!(mem.read_message(p, addr), Ok(Message::default()));
            let msg = Message::new(3, &[1, 2]);
            mem.write_message(p, addr, &msg).unwrap();
            assert_eq!(mem.peek(p, addr), Some(msg));
            assert_eq!(mem.write_count(), 1);

            mem.inject_fault(p, addr);
            assert_eq!(mem.read_message(p, addr), Err(CopyError::Unmapped));
            assert_eq!(
                mem.write_message(p, addr, &Message::default()),
                Err(CopyError::ReadOnly)
            );
            assert_eq!(mem.peek(p, addr), Some(msg));
        }

        #[test]
        fn test_clock_advances() {
            let clock = MockClock::new(10);
            clock.advance(5);
            assert_eq!(clock.uptime(), 15);
        }
    }
}
