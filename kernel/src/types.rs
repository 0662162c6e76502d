//! Identifier newtypes shared by the process table, the privilege table and
//! the IPC core.
//!
//! A process is named two ways: by its slot in the process table
//! ([`ProcNr`], never exposed to user space) and by its [`Endpoint`], which
//! tags the slot with a generation so that a reference held across a slot's
//! exit and respawn is detected as stale.

use core::fmt;

use crate::config::NR_TASKS;

/// Index of a slot in the process table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProcNr(u16);

impl ProcNr {
    /// Creates a slot index from a raw value.
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw slot value.
    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Returns the slot as an index into table-owned vectors.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Is this one of the kernel-task slots?
    #[inline]
    pub const fn is_task(self) -> bool {
        (self.0 as usize) < NR_TASKS
    }
}

impl fmt::Display for ProcNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of low bits of an endpoint that carry the slot index.
pub const ENDPOINT_SLOT_BITS: u32 = 15;

const ENDPOINT_SLOT_MASK: i32 = (1 << ENDPOINT_SLOT_BITS) - 1;

/// Largest generation that fits in an endpoint before wrapping.
pub const MAX_GENERATION: u32 = (i32::MAX >> ENDPOINT_SLOT_BITS) as u32;

/// Externally visible, generation-tagged process identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Endpoint(i32);

impl Endpoint {
    /// Wildcard source accepted by RECEIVE.
    pub const ANY: Self = Self(0x7ace);

    /// Placeholder for "no process".
    pub const NONE: Self = Self(0x6ace);

    /// Builds the endpoint of `nr` in its `generation`-th incarnation.
    #[inline]
    pub const fn new(generation: u32, nr: ProcNr) -> Self {
        Self(((generation as i32) << ENDPOINT_SLOT_BITS) | nr.as_raw() as i32)
    }

    /// Reinterprets a raw 32-bit identifier taken from a register or message.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw 32-bit value.
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Slot encoded in this endpoint. Meaningless for [`Endpoint::ANY`] and
    /// [`Endpoint::NONE`].
    #[inline]
    pub const fn slot(self) -> ProcNr {
        ProcNr((self.0 & ENDPOINT_SLOT_MASK) as u16)
    }

    /// Generation encoded in this endpoint.
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> ENDPOINT_SLOT_BITS) as u32
    }

    #[inline]
    pub const fn is_any(self) -> bool {
        self.0 == Self::ANY.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => f.write_str("ANY"),
            Self::NONE => f.write_str("NONE"),
            ep => write!(f, "{}/{}", ep.slot(), ep.generation()),
        }
    }
}

/// Returns the generation a slot gets on its next reuse.
#[inline]
pub const fn next_generation(generation: u32) -> u32 {
    if generation >= MAX_GENERATION {
        1
    } else {
        generation + 1
    }
}

/// Compact privilege identifier; indexes send-masks and pending bitmaps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PrivId(u16);

impl PrivId {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Source filter of a blocked RECEIVE.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    /// Accept a message from anyone.
    Any,
    /// Accept a message only from this slot.
    Proc(ProcNr),
}

impl Peer {
    /// Does this filter accept a message from `src`?
    #[inline]
    pub fn accepts(self, src: ProcNr) -> bool {
        match self {
            Peer::Any => true,
            Peer::Proc(nr) => nr == src,
        }
    }
}

/// Address of a message buffer inside a process's own address space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirAddr(usize);

impl VirAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}
