//! # Reply Objects
//!
//! A reply object links a caller blocked in the receive half of SENDREC to
//! the one process allowed to answer it with REPLY.
//!
//! Allocation hands out a [`ReplyTicket`]. The ticket is neither `Clone` nor
//! `Copy` and [`ReplyPool::release`] consumes it, so each allocation is
//! released at most once and a released object cannot be named again. The
//! blocked caller's process record is the only place a ticket is stored.
//!
//! ```compile_fail
//! use rendezvous::ipc::ReplyPool;
//! use rendezvous::types::{Endpoint, ProcNr};
//!
//! let mut pool = ReplyPool::new(1);
//! let a = ProcNr::from_raw(4);
//! let ticket = pool.allocate(a, ProcNr::from_raw(5), Endpoint::new(0, a)).unwrap();
//! pool.release(ticket);
//! pool.release(ticket); // use of moved value
//! ```

use alloc::vec::Vec;

use crate::types::{Endpoint, ProcNr};

/// Live record of a pending SENDREC reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyObject {
    /// Slot of the blocked caller
    pub caller: ProcNr,
    /// Endpoint of the caller when the object was allocated
    pub caller_ep: Endpoint,
    /// The only slot allowed to reply
    pub target: ProcNr,
}

/// Unique handle to an allocated [`ReplyObject`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reply ticket must be stored or released"]
pub struct ReplyTicket(usize);

impl ReplyTicket {
    /// Pool slot this ticket refers to.
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Fixed-capacity pool of reply objects.
pub struct ReplyPool {
    slots: Vec<Option<ReplyObject>>,
    in_use: usize,
}

impl ReplyPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize(capacity, None);
        Self { slots, in_use: 0 }
    }

    /// Takes the first free object. Returns `None` when the pool is exhausted.
    pub fn allocate(
        &mut self,
        caller: ProcNr,
        target: ProcNr,
        caller_ep: Endpoint,
    ) -> Option<ReplyTicket> {
        let idx = self.slots.iter().position(Option::is_none)?;
        self.slots[idx] = Some(ReplyObject {
            caller,
            caller_ep,
            target,
        });
        self.in_use += 1;
        log::trace!("reply object {idx} allocated: caller {caller} target {target}");
        Some(ReplyTicket(idx))
    }

    /// The object behind `ticket`, if it is still in use.
    pub fn get(&self, ticket: &ReplyTicket) -> Option<&ReplyObject> {
        self.slots.get(ticket.0).and_then(Option::as_ref)
    }

    /// Frees the object behind `ticket`.
    pub fn release(&mut self, ticket: ReplyTicket) {
        if let Some(slot) = self.slots.get_mut(ticket.0) {
            if slot.take().is_some() {
                self.in_use -= 1;
                log::trace!("reply object {} released", ticket.0);
            }
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.slots.len() - self.in_use
    }

    /// In-use objects and their pool slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ReplyObject)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|obj| (idx, obj)))
    }
}
