//! # Synchronous IPC
//!
//! Rendezvous message passing between processes. Every call names a peer
//! and a message buffer in the caller's address space:
//!
//! - `SEND` delivers to a waiting receiver or blocks on its caller queue
//! - `RECEIVE` takes a pending notification, then a queued sender, or blocks
//! - `SENDREC` sends, then blocks until the destination answers with `REPLY`
//! - `NOTIFY` delivers a synthesized message now or marks it pending
//! - `ECHO` copies the caller's message back to itself
//! - `REPLY` completes a blocked `SENDREC`
//!
//! ## Validation
//!
//! A call is checked against the caller's trap mask, then its peer, then
//! (for calls that deliver) the caller's send-mask and the destination's
//! liveness. Rejections leave no trace in kernel state.
//!
//! ## Reply objects
//!
//! The receive half of `SENDREC` holds a [`ReplyTicket`] naming the one
//! process allowed to answer. The ticket is consumed by `REPLY`, or released
//! when the receive half does not block or a peer dies.

pub mod message;
mod notification;
pub mod reply;
mod transfer;


pub use message::{notify_from, Message, NotifyPayload, MESS_WORDS, NOTIFY_MESSAGE};
pub use reply::{ReplyObject, ReplyPool, ReplyTicket};
pub(crate) use transfer::copy_fault;

use crate::error::{IpcError, IpcResult};
use crate::kernel::Kernel;
use crate::traits::{AddressSpaceOps, ClockOps};
use crate::types::{Endpoint, Peer, ProcNr, VirAddr};

/// Mask of the function number in a raw call word.
pub const SYSCALL_FUNC: u32 = 0x0F;
/// Mask of the flag bits in a raw call word.
pub const SYSCALL_FLAGS: u32 = 0xF0;

/// IPC call numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Call {
    Send = 1,
    Receive = 2,
    SendRec = 3,
    Notify = 4,
    Reply = 5,
    Echo = 8,
}

impl Call {
    pub const fn from_raw(function: u32) -> Option<Self> {
        match function {
            1 => Some(Call::Send),
            2 => Some(Call::Receive),
            3 => Some(Call::SendRec),
            4 => Some(Call::Notify),
            5 => Some(Call::Reply),
            8 => Some(Call::Echo),
            _ => None,
        }
    }

    /// Calls subject to the send-mask and the liveness check.
    pub const fn checks_destination(self) -> bool {
        matches!(self, Call::Send | Call::SendRec | Call::Notify)
    }

    /// Calls that may name a kernel task as peer. Tasks never block on a
    /// caller that does not receive right away.
    pub const fn may_target_task(self) -> bool {
        matches!(self, Call::SendRec | Call::Receive)
    }

    /// Raw call word for this call with `flags`.
    #[inline]
    pub const fn with_flags(self, flags: IpcFlags) -> u32 {
        self as u32 | flags.bits()
    }
}

bitflags::bitflags! {
    /// Flags carried in the upper nibble of the call word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IpcFlags: u32 {
        /// Fail with `NotReady` instead of blocking
        const NON_BLOCKING = 0x10;
    }
}

impl<M: AddressSpaceOps, C: ClockOps> Kernel<M, C> {
    /// Single entry point of the trap path.
    ///
    /// `call_nr` carries the function in its low nibble and [`IpcFlags`] in
    /// the next. `src_dst` is the peer endpoint (or `ANY`), and `m_ptr` the
    /// message buffer in `caller`'s address space.
    pub fn sys_call(
        &mut self,
        caller: ProcNr,
        call_nr: u32,
        src_dst: Endpoint,
        m_ptr: VirAddr,
    ) -> IpcResult {
        let flags = IpcFlags::from_bits_truncate(call_nr & SYSCALL_FLAGS);
        let (call, peer) = self.validate(caller, call_nr & SYSCALL_FUNC, src_dst)?;

        let msg = match call {
            Call::Receive => Message::default(),
            _ => self.mem.read_message(caller, m_ptr).map_err(|err| {
                log::warn!("sys_call: bad message pointer, caller {caller}: {err}");
                IpcError::Fault
            })?,
        };

        let result = match (call, peer) {
            (Call::SendRec, Peer::Proc(dst)) => self.do_sendrec(caller, dst, &msg, m_ptr, flags),
            (Call::Send, Peer::Proc(dst)) => self.mini_send(caller, dst, &msg, m_ptr, flags),
            (Call::Notify, Peer::Proc(dst)) => self.mini_notify(caller, dst, msg.badge()),
            (Call::Receive, src) => {
                self.end_sendrec(caller);
                self.mini_receive(caller, src, m_ptr, flags)
            }
            (Call::Echo, _) => self.do_echo(caller, &msg, m_ptr),
            (Call::Reply, _) => self.do_reply(caller, &msg),
            (_, Peer::Any) => Err(IpcError::BadPeer),
        };
        log::trace!("sys_call: {caller} {call:?} {src_dst} -> {result:?}");
        result
    }

    /// Trap-mask, peer and destination checks. Returns the decoded call and
    /// its peer; destination-checked calls always get a concrete peer.
    fn validate(
        &self,
        caller: ProcNr,
        function: u32,
        src_dst: Endpoint,
    ) -> Result<(Call, Peer), IpcError> {
        let record = self.priv_of(caller).ok_or(IpcError::CallDenied)?;
        let call = Call::from_raw(function);
        let is_echo = call == Some(Call::Echo);

        if !record.trap_mask.allows(function) {
            log::warn!("sys_call: trap {function} not allowed, caller {caller}, src_dst {src_dst}");
            return Err(IpcError::CallDenied);
        }

        let peer = if src_dst.is_any() {
            Some(Peer::Any)
        } else if src_dst.as_raw() >= 0 && self.procs.is_ok_procn(src_dst.slot()) {
            Some(Peer::Proc(src_dst.slot()))
        } else {
            None
        };

        if !is_echo {
            if let Some(Peer::Proc(nr)) = peer {
                if nr.is_task() && !call.is_some_and(Call::may_target_task) {
                    log::warn!("sys_call: trap {function} to task {nr} denied, caller {caller}");
                    return Err(IpcError::CallDenied);
                }
            }
        }
        let peer = match peer {
            Some(peer) => peer,
            None if is_echo => Peer::Any,
            None => {
                log::warn!("sys_call: invalid src_dst {src_dst}, caller {caller}");
                return Err(IpcError::BadPeer);
            }
        };

        let Some(call) = call else {
            log::warn!("sys_call: unknown trap {function}, caller {caller}");
            return Err(IpcError::BadCall);
        };

        if call.checks_destination() {
            let Peer::Proc(dst) = peer else {
                log::warn!("sys_call: {call:?} to ANY, caller {caller}");
                return Err(IpcError::BadPeer);
            };
            self.check_destination(caller, dst, src_dst)?;
        }
        Ok((call, peer))
    }

    fn check_destination(
        &self,
        caller: ProcNr,
        dst: ProcNr,
        ep: Endpoint,
    ) -> Result<(), IpcError> {
        let target = &self.procs[dst];
        let Some(dst_id) = target.priv_id else {
            log::warn!("sys_call: dead dest {dst}, caller {caller}");
            return Err(IpcError::DeadDestination);
        };

        let allowed = self.priv_of(caller).is_some_and(|r| r.may_send_to(dst_id));
        if !allowed {
            log::warn!("sys_call: ipc mask denied {caller} sending to {dst}");
            return Err(IpcError::CallDenied);
        }

        if target.is_free() && !self.shutdown_started {
            log::warn!("sys_call: dead dest {dst}, caller {caller}");
            return Err(IpcError::DeadDestination);
        }
        if !target.is_free() && target.endpoint != ep {
            log::warn!("sys_call: stale endpoint {ep} for {dst}, caller {caller}");
            return Err(IpcError::DeadDestination);
        }
        Ok(())
    }

    /// Send the message at `m_ptr` to `dst`.
    pub fn send(
        &mut self,
        caller: ProcNr,
        dst: Endpoint,
        m_ptr: VirAddr,
        flags: IpcFlags,
    ) -> IpcResult {
        self.sys_call(caller, Call::Send.with_flags(flags), dst, m_ptr)
    }

    /// Receive from `src` (or [`Endpoint::ANY`]) into `m_ptr`.
    pub fn receive(
        &mut self,
        caller: ProcNr,
        src: Endpoint,
        m_ptr: VirAddr,
        flags: IpcFlags,
    ) -> IpcResult {
        self.sys_call(caller, Call::Receive.with_flags(flags), src, m_ptr)
    }

    /// Send the message at `m_ptr` to `dst` and wait for its reply in the
    /// same buffer.
    pub fn sendrec(
        &mut self,
        caller: ProcNr,
        dst: Endpoint,
        m_ptr: VirAddr,
        flags: IpcFlags,
    ) -> IpcResult {
        self.sys_call(caller, Call::SendRec.with_flags(flags), dst, m_ptr)
    }

    /// Notify `dst`, attaching `badge` if it is waiting now.
    pub fn notify(&mut self, caller: ProcNr, dst: Endpoint, badge: u64) -> IpcResult {
        let (_, peer) = self.validate(caller, Call::Notify as u32, dst)?;
        match peer {
            Peer::Proc(dst) => self.mini_notify(caller, dst, badge),
            Peer::Any => Err(IpcError::BadPeer),
        }
    }

    /// Answer the SENDREC caller named by the `m_type` of the message at
    /// `m_ptr`.
    ///
    /// `target` is only range-checked. The message alone decides who is
    /// answered, so a buffer addressed to another caller answers that caller.
    pub fn reply(&mut self, caller: ProcNr, target: Endpoint, m_ptr: VirAddr) -> IpcResult {
        self.sys_call(caller, Call::Reply as u32, target, m_ptr)
    }

    /// Copy the message at `m_ptr` back into itself.
    pub fn echo(&mut self, caller: ProcNr, m_ptr: VirAddr) -> IpcResult {
        self.sys_call(caller, Call::Echo as u32, Endpoint::NONE, m_ptr)
    }
}
