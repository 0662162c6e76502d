//! Process management
//!
//! The process table is a fixed arena of slots addressed by [`ProcNr`]. Slots
//! are seeded at boot from an image table, reused after exit with a bumped
//! generation, and never deallocated: a dead slot is simply `SLOT_FREE`.
//!
//! Lists that thread through processes (ready queues, caller queues) are
//! intrusive and use slot handles as links, so no node is ever allocated.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use thiserror::Error;

use crate::config::{ConfigError, DEFAULT_QUANTUM, IDLE_Q, NR_TASKS, P_NAME_LEN, TASK_Q};
use crate::error::IpcError;
use crate::ipc::ReplyTicket;
use crate::privilege::{PrivFlags, TrapMask};
use crate::types::{Endpoint, Peer, PrivId, ProcNr, VirAddr};

bitflags::bitflags! {
    /// Reasons a process is not runnable. Empty means runnable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RtsFlags: u32 {
        /// Slot is not in use
        const SLOT_FREE = 1 << 0;
        /// Blocked trying to send
        const SENDING = 1 << 1;
        /// Blocked waiting for a message
        const RECEIVING = 1 << 2;
        /// Signal delivery in progress
        const SIGNALED = 1 << 3;
        /// Unhandled signal pending
        const SIG_PENDING = 1 << 4;
        /// Stopped by a tracer or by the kernel
        const P_STOP = 1 << 5;
        /// No privilege record bound
        const NO_PRIV = 1 << 6;
        /// Endpoint revoked
        const NO_ENDPOINT = 1 << 7;
        /// Waiting for the memory manager to resolve a fault
        const PAGEFAULT = 1 << 8;
    }
}

/// Process control block
#[derive(Debug)]
pub struct Process {
    /// Slot index
    pub nr: ProcNr,
    /// Current endpoint (generation-tagged slot)
    pub endpoint: Endpoint,
    /// Incarnation count of this slot
    pub generation: u32,
    /// Human-readable name
    pub name: heapless::String<P_NAME_LEN>,
    /// Run-state; runnable iff empty
    pub rts: RtsFlags,
    /// Bound privilege record
    pub priv_id: Option<PrivId>,
    /// Current ready queue
    pub priority: u8,
    /// Best queue this process may be promoted to
    pub max_priority: u8,
    /// Ticks granted per quantum
    pub quantum_size: u32,
    /// Ticks left in the current quantum
    pub ticks_left: u32,
    /// Ticks spent running
    pub user_time: u64,
    /// Ticks billed to this process by non-billable work
    pub sys_time: u64,
    /// Slot this process is blocked sending to
    pub sendto: Option<ProcNr>,
    /// Filter of a blocked receive
    pub getfrom: Peer,
    /// Message buffer in this process's address space
    pub messbuf: VirAddr,
    /// Result delivered when woken by a peer's death
    pub wake_status: Option<IpcError>,
    pub(crate) next_ready: Option<ProcNr>,
    pub(crate) caller_q: Option<ProcNr>,
    pub(crate) q_link: Option<ProcNr>,
    pub(crate) reply: Option<ReplyTicket>,
}

impl Process {
    fn free(nr: ProcNr) -> Self {
        Self {
            nr,
            endpoint: Endpoint::new(0, nr),
            generation: 0,
            name: heapless::String::new(),
            rts: RtsFlags::SLOT_FREE,
            priv_id: None,
            priority: IDLE_Q,
            max_priority: IDLE_Q,
            quantum_size: 0,
            ticks_left: 0,
            user_time: 0,
            sys_time: 0,
            sendto: None,
            getfrom: Peer::Any,
            messbuf: VirAddr::default(),
            wake_status: None,
            next_ready: None,
            caller_q: None,
            q_link: None,
            reply: None,
        }
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.rts.is_empty()
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.rts.contains(RtsFlags::SLOT_FREE)
    }

    /// Is this process blocked in the receive half of a SENDREC?
    #[inline]
    pub fn holds_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Fills the slot from an image entry. Name overflow is truncated.
    pub(crate) fn install(&mut self, entry: &ImageEntry<'_>, generation: u32) {
        let mut name = heapless::String::new();
        for c in entry.name.chars() {
            if name.push(c).is_err() {
                break;
            }
        }
        let quantum = if entry.quantum == 0 { DEFAULT_QUANTUM } else { entry.quantum };

        *self = Self {
            endpoint: Endpoint::new(generation, self.nr),
            generation,
            name,
            rts: RtsFlags::empty(),
            priv_id: self.priv_id,
            priority: entry.priority,
            max_priority: entry.priority,
            quantum_size: quantum,
            ticks_left: quantum,
            ..Self::free(self.nr)
        };
    }
}

/// One entry of the boot image, or the description of a process to spawn.
#[derive(Clone, Copy, Debug)]
pub struct ImageEntry<'a> {
    pub nr: ProcNr,
    pub name: &'a str,
    pub priority: u8,
    /// Zero selects [`DEFAULT_QUANTUM`]
    pub quantum: u32,
    pub trap_mask: TrapMask,
    pub flags: PrivFlags,
    /// Slots this process may send to
    pub send_to: &'a [ProcNr],
}

/// The kernel tasks, installed ahead of any image entries.
pub const BOOT_TASKS: [ImageEntry<'static>; NR_TASKS] = [
    ImageEntry {
        nr: ProcNr::from_raw(crate::config::IDLE as u16),
        name: "idle",
        priority: IDLE_Q,
        quantum: DEFAULT_QUANTUM,
        trap_mask: TrapMask::empty(),
        flags: PrivFlags::PREEMPTIBLE.union(PrivFlags::BILLABLE),
        send_to: &[],
    },
    ImageEntry {
        nr: ProcNr::from_raw(crate::config::CLOCK as u16),
        name: "clock",
        priority: TASK_Q,
        quantum: DEFAULT_QUANTUM,
        trap_mask: TrapMask::TASK,
        flags: PrivFlags::SYS_PROC,
        send_to: &[],
    },
    ImageEntry {
        nr: ProcNr::from_raw(crate::config::SYSTEM as u16),
        name: "system",
        priority: TASK_Q,
        quantum: DEFAULT_QUANTUM,
        trap_mask: TrapMask::TASK,
        flags: PrivFlags::SYS_PROC,
        send_to: &[],
    },
    ImageEntry {
        nr: ProcNr::from_raw(crate::config::HARDWARE as u16),
        name: "hardware",
        priority: TASK_Q,
        quantum: DEFAULT_QUANTUM,
        trap_mask: TrapMask::empty(),
        flags: PrivFlags::SYS_PROC,
        send_to: &[],
    },
];

/// Failures while installing a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("slot {0} is outside the process table")]
    SlotOutOfRange(ProcNr),
    #[error("slot {0} is in use")]
    SlotInUse(ProcNr),
    #[error("slot {0} is reserved for a kernel task")]
    ReservedSlot(ProcNr),
    #[error("no privilege record left for slot {0}")]
    NoPrivilege(ProcNr),
    #[error("send target {0} is not a live process")]
    BadTarget(ProcNr),
    #[error("priority {0} is outside the user queues")]
    BadPriority(u8),
}

/// Fixed-capacity arena of process slots.
pub struct ProcTable {
    procs: Vec<Process>,
}

impl ProcTable {
    /// Creates a table of `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            procs: (0..capacity)
                .map(|i| Process::free(ProcNr::from_raw(i as u16)))
                .collect(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.procs.len()
    }

    /// Is `nr` a slot of this table?
    #[inline]
    pub fn is_ok_procn(&self, nr: ProcNr) -> bool {
        nr.as_index() < self.procs.len()
    }

    #[inline]
    pub fn get(&self, nr: ProcNr) -> Option<&Process> {
        self.procs.get(nr.as_index())
    }

    #[inline]
    pub fn get_mut(&mut self, nr: ProcNr) -> Option<&mut Process> {
        self.procs.get_mut(nr.as_index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.procs.iter()
    }

    /// Resolves an endpoint to the live process it names.
    pub fn resolve(&self, ep: Endpoint) -> Result<ProcNr, IpcError> {
        let nr = ep.slot();
        let proc = self.get(nr).ok_or(IpcError::BadPeer)?;
        if proc.is_free() || proc.endpoint != ep {
            return Err(IpcError::DeadDestination);
        }
        Ok(nr)
    }

    /// Appends `sender` to the tail of `owner`'s caller queue.
    pub(crate) fn append_caller(&mut self, owner: ProcNr, sender: ProcNr) {
        self[sender].q_link = None;
        match self.caller_tail(owner) {
            None => self[owner].caller_q = Some(sender),
            Some(tail) => self[tail].q_link = Some(sender),
        }
    }

    /// Removes `sender` from `owner`'s caller queue. Returns false if it was
    /// not queued there.
    pub(crate) fn unlink_caller(&mut self, owner: ProcNr, sender: ProcNr) -> bool {
        let mut prev: Option<ProcNr> = None;
        let mut cursor = self[owner].caller_q;
        while let Some(nr) = cursor {
            if nr == sender {
                let next = self[nr].q_link.take();
                match prev {
                    None => self[owner].caller_q = next,
                    Some(p) => self[p].q_link = next,
                }
                return true;
            }
            prev = cursor;
            cursor = self[nr].q_link;
        }
        false
    }

    fn caller_tail(&self, owner: ProcNr) -> Option<ProcNr> {
        self.callers(owner).last()
    }

    /// Processes blocked sending to `owner`, in arrival order.
    pub fn callers(&self, owner: ProcNr) -> Callers<'_> {
        Callers {
            table: self,
            cursor: self.get(owner).and_then(|p| p.caller_q),
            budget: self.procs.len(),
        }
    }
}

impl Index<ProcNr> for ProcTable {
    type Output = Process;

    /// Panics on a slot outside the table. Slots reaching the IPC paths have
    /// been range-checked at the trap boundary.
    fn index(&self, nr: ProcNr) -> &Process {
        &self.procs[nr.as_index()]
    }
}

impl IndexMut<ProcNr> for ProcTable {
    fn index_mut(&mut self, nr: ProcNr) -> &mut Process {
        &mut self.procs[nr.as_index()]
    }
}

/// Iterator over a caller queue. Bounded by the table size so a corrupted
/// link cannot loop forever.
pub struct Callers<'a> {
    table: &'a ProcTable,
    cursor: Option<ProcNr>,
    budget: usize,
}

impl Iterator for Callers<'_> {
    type Item = ProcNr;

    fn next(&mut self) -> Option<ProcNr> {
        let nr = self.cursor?;
        if self.budget == 0 {
            return None;
        }
        self.budget -= 1;
        self.cursor = self.table.get(nr).and_then(|p| p.q_link);
        Some(nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nr(n: u16) -> ProcNr {
        ProcNr::from_raw(n)
    }

    fn entry(n: u16) -> ImageEntry<'static> {
        ImageEntry {
            nr: nr(n),
            name: "worker",
            priority: 7,
            quantum: 0,
            trap_mask: TrapMask::USER,
            flags: PrivFlags::empty(),
            send_to: &[],
        }
    }

    #[test]
    fn test_new_table_is_free() {
        let table = ProcTable::new(8);
        assert_eq!(table.capacity(), 8);
        assert!(table.iter().all(Process::is_free));
        assert!(table.is_ok_procn(nr(7)));
        assert!(!table.is_ok_procn(nr(8)));
    }

    #[test]
    fn test_install_sets_schedule_fields() {
        let mut table = ProcTable::new(8);
        table[nr(5)].install(&entry(5), 2);

        let p = &table[nr(5)];
        assert!(p.is_runnable());
        assert_eq!(p.endpoint, Endpoint::new(2, nr(5)));
        assert_eq!(p.quantum_size, DEFAULT_QUANTUM);
        assert_eq!(p.ticks_left, DEFAULT_QUANTUM);
        assert_eq!(p.max_priority, 7);
        assert_eq!(p.name(), "worker");
    }

    #[test]
    fn test_install_truncates_long_name() {
        let mut table = ProcTable::new(2);
        let mut e = entry(1);
        e.name = "a-process-name-longer-than-the-limit";
        table[nr(1)].install(&e, 0);
        assert_eq!(table[nr(1)].name().len(), P_NAME_LEN);
    }

    #[test]
    fn test_resolve() {
        let mut table = ProcTable::new(8);
        table[nr(5)].install(&entry(5), 1);

        assert_eq!(table.resolve(Endpoint::new(1, nr(5))), Ok(nr(5)));
        assert_eq!(
            table.resolve(Endpoint::new(0, nr(5))),
            Err(IpcError::DeadDestination)
        );
        assert_eq!(
            table.resolve(Endpoint::new(0, nr(6))),
            Err(IpcError::DeadDestination)
        );
        assert_eq!(table.resolve(Endpoint::new(0, nr(40))), Err(IpcError::BadPeer));
    }

    #[test]
    fn test_caller_queue_is_fifo() {
        let mut table = ProcTable::new(8);
        table.append_caller(nr(1), nr(4));
        table.append_caller(nr(1), nr(2));
        table.append_caller(nr(1), nr(6));
        assert_eq!(table.callers(nr(1)).collect::<Vec<_>>(), [nr(4), nr(2), nr(6)]);

        assert!(table.unlink_caller(nr(1), nr(2)));
        assert_eq!(table.callers(nr(1)).collect::<Vec<_>>(), [nr(4), nr(6)]);

        assert!(table.unlink_caller(nr(1), nr(4)));
        table.append_caller(nr(1), nr(3));
        assert_eq!(table.callers(nr(1)).collect::<Vec<_>>(), [nr(6), nr(3)]);
        assert!(!table.unlink_caller(nr(1), nr(4)));
    }
}
