//! # Rendezvous IPC Core
//!
//! The message-passing and scheduling heart of a small microkernel.
//!
//! ## Design Principles
//!
//! - **Synchronous Rendezvous**: a message is copied once, straight from the
//!   sender's buffer into the receiver's, when both sides are ready
//! - **Explicit Context**: every table lives in one [`Kernel`] value; holding
//!   `&mut Kernel` is the proof of exclusive access
//! - **Owned Reply Objects**: the right to answer a SENDREC is a move-only
//!   ticket, released exactly once
//! - **Multilevel Feedback**: processes that hog the CPU sink, processes that
//!   yield climb back
//!
//! ## Layout
//!
//! - [`ipc`]: SEND, RECEIVE, SENDREC, NOTIFY, REPLY, ECHO and the dispatch
//!   core that validates them
//! - [`sched`]: ready queues and the feedback policy
//! - [`kernel`]: boot, spawn, exit and clock ticks
//! - [`sync`]: serialized gateways for interrupt handlers and kernel tasks
//! - [`syscall`]: trap-frame decoding
//!
//! The crate is `no_std` and only needs `alloc` for its fixed-size tables.
//! Address-space copies and the clock are supplied by the embedding kernel
//! through [`traits`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod invariants;
pub mod ipc;
pub mod kernel;
pub mod privilege;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod sync;
pub mod traits;
pub mod types;

pub use config::KernelConfig;
pub use error::{IpcError, IpcOutcome, IpcResult};
pub use ipc::{Call, IpcFlags, Message};
pub use kernel::Kernel;
pub use process::{ImageEntry, SpawnError};
pub use sync::KernelLock;
pub use types::{Endpoint, ProcNr, VirAddr};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
