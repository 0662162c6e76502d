//! # Privilege Table
//!
//! Per-process IPC policy, kept apart from the process control block and
//! indexed by a compact [`PrivId`]. A privilege record carries:
//!
//! - the trap mask (which calls the process may make),
//! - the send-mask (which privilege ids it may send to),
//! - the pending-notification bitmap (indexed by the notifier's id),
//! - pending interrupt and signal sets delivered with HARDWARE and SYSTEM
//!   notifications.
//!
//! A record stays bound to its process slot for the lifetime of the kernel.
//! When the slot is respawned the record is reset and reused.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use crate::config::MAX_SYS_PROCS;
use crate::types::{PrivId, ProcNr};

bitflags::bitflags! {
    /// Calls a process may invoke. Bit `n` permits call number `n`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TrapMask: u16 {
        /// Blocking or non-blocking send
        const SEND = 1 << 1;
        /// Receive from a peer or from anyone
        const RECEIVE = 1 << 2;
        /// Send then wait for an explicit reply
        const SENDREC = 1 << 3;
        /// Asynchronous notification
        const NOTIFY = 1 << 4;
        /// Answer a blocked SENDREC caller
        const REPLY = 1 << 5;
        /// Copy a message back to oneself
        const ECHO = 1 << 8;

        /// Kernel tasks and servers
        const TASK = Self::SEND.bits() | Self::RECEIVE.bits() | Self::SENDREC.bits()
            | Self::NOTIFY.bits() | Self::REPLY.bits() | Self::ECHO.bits();
        /// Ordinary user processes
        const USER = Self::SENDREC.bits() | Self::ECHO.bits();
    }
}

impl TrapMask {
    /// Does this mask permit raw function number `function`?
    #[inline]
    pub fn allows(self, function: u32) -> bool {
        function < u16::BITS && self.bits() & (1 << function) != 0
    }
}

bitflags::bitflags! {
    /// Privilege and status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PrivFlags: u8 {
        /// Quantum counts down on clock ticks
        const PREEMPTIBLE = 1 << 0;
        /// Becomes the billing target when picked
        const BILLABLE = 1 << 1;
        /// System process with its own policy record
        const SYS_PROC = 1 << 2;
        /// Inside SENDREC; notifications may not interrupt
        const SENDREC_BUSY = 1 << 3;
    }
}

const SYS_MAP_WORDS: usize = MAX_SYS_PROCS / u64::BITS as usize;

/// Fixed-width bitmap indexed by [`PrivId`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SysMap {
    chunks: [u64; SYS_MAP_WORDS],
}

impl SysMap {
    pub const fn new() -> Self {
        Self {
            chunks: [0; SYS_MAP_WORDS],
        }
    }

    #[inline]
    fn locate(id: PrivId) -> (usize, u64) {
        let idx = id.as_index();
        (idx / 64, 1u64 << (idx % 64))
    }

    pub fn set(&mut self, id: PrivId) {
        let (word, bit) = Self::locate(id);
        if let Some(chunk) = self.chunks.get_mut(word) {
            *chunk |= bit;
        }
    }

    pub fn unset(&mut self, id: PrivId) {
        let (word, bit) = Self::locate(id);
        if let Some(chunk) = self.chunks.get_mut(word) {
            *chunk &= !bit;
        }
    }

    pub fn get(&self, id: PrivId) -> bool {
        let (word, bit) = Self::locate(id);
        self.chunks.get(word).is_some_and(|chunk| chunk & bit != 0)
    }

    /// Sets the first `n` bits.
    pub fn fill(&mut self, n: usize) {
        for idx in 0..n.min(MAX_SYS_PROCS) {
            self.set(PrivId::from_raw(idx as u16));
        }
    }

    pub fn clear(&mut self) {
        self.chunks = [0; SYS_MAP_WORDS];
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|&c| c == 0)
    }

    pub fn count(&self) -> usize {
        self.chunks.iter().map(|c| c.count_ones() as usize).sum()
    }

    /// Set bits, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = PrivId> + '_ {
        self.chunks.iter().enumerate().flat_map(|(word, &chunk)| {
            let mut bits = chunk;
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                Some(PrivId::from_raw((word * 64 + bit as usize) as u16))
            })
        })
    }
}

/// IPC policy and pending state of one process.
#[derive(Clone, Debug)]
pub struct Priv {
    id: PrivId,
    /// Slot this record is bound to, if any.
    pub proc_nr: Option<ProcNr>,
    pub flags: PrivFlags,
    pub trap_mask: TrapMask,
    /// Permitted destinations, by privilege id
    pub ipc_to: SysMap,
    /// Notifiers whose notification has not been delivered yet
    pub notify_pending: SysMap,
    /// Interrupts reported with the next HARDWARE notification
    pub int_pending: u32,
    /// Signals reported with the next SYSTEM notification
    pub sig_pending: u64,
}

impl Priv {
    fn new(id: PrivId) -> Self {
        Self {
            id,
            proc_nr: None,
            flags: PrivFlags::empty(),
            trap_mask: TrapMask::empty(),
            ipc_to: SysMap::new(),
            notify_pending: SysMap::new(),
            int_pending: 0,
            sig_pending: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> PrivId {
        self.id
    }

    /// Rebinds the record to `nr` with fresh policy and no pending state.
    pub fn reset(&mut self, nr: ProcNr, flags: PrivFlags, trap_mask: TrapMask) {
        *self = Self {
            proc_nr: Some(nr),
            flags: flags - PrivFlags::SENDREC_BUSY,
            trap_mask,
            ..Self::new(self.id)
        };
    }

    #[inline]
    pub fn is_sendrec_busy(&self) -> bool {
        self.flags.contains(PrivFlags::SENDREC_BUSY)
    }

    #[inline]
    pub fn may_send_to(&self, dst: PrivId) -> bool {
        self.ipc_to.get(dst)
    }
}

/// Fixed-capacity table of privilege records.
pub struct PrivTable {
    privs: Vec<Priv>,
}

impl PrivTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_SYS_PROCS);
        Self {
            privs: (0..capacity)
                .map(|id| Priv::new(PrivId::from_raw(id as u16)))
                .collect(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.privs.len()
    }

    #[inline]
    pub fn get(&self, id: PrivId) -> Option<&Priv> {
        self.privs.get(id.as_index())
    }

    #[inline]
    pub fn get_mut(&mut self, id: PrivId) -> Option<&mut Priv> {
        self.privs.get_mut(id.as_index())
    }

    /// Binds the first unbound record to `nr`.
    pub fn alloc(&mut self, nr: ProcNr) -> Option<PrivId> {
        let record = self.privs.iter_mut().find(|p| p.proc_nr.is_none())?;
        record.proc_nr = Some(nr);
        Some(record.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Priv> {
        self.privs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Priv> {
        self.privs.iter_mut()
    }
}

impl Index<PrivId> for PrivTable {
    type Output = Priv;

    /// Panics on an id outside the table; ids come from [`PrivTable::alloc`].
    fn index(&self, id: PrivId) -> &Priv {
        &self.privs[id.as_index()]
    }
}

impl IndexMut<PrivId> for PrivTable {
    fn index_mut(&mut self, id: PrivId) -> &mut Priv {
        &mut self.privs[id.as_index()]
    }
}
