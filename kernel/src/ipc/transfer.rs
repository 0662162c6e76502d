//! Message transfer: SEND, RECEIVE, SENDREC, REPLY and ECHO.
//!
//! A sender that finds its destination waiting copies straight into the
//! destination's buffer. Otherwise it blocks on the destination's caller
//! queue and the message stays in the sender's own buffer until a RECEIVE
//! pulls it out.

use super::{IpcFlags, Message};
use crate::error::{IpcError, IpcOutcome, IpcResult};
use crate::kernel::Kernel;
use crate::privilege::PrivFlags;
use crate::process::RtsFlags;
use crate::traits::{AddressSpaceOps, ClockOps, CopyError};
use crate::types::{Peer, ProcNr, VirAddr};

/// Logs a failed copy and maps it to [`IpcError::Fault`].
pub(crate) fn copy_fault(site: &'static str, nr: ProcNr, err: CopyError) -> IpcError {
    log::warn!("{site}: message copy for {nr} failed: {err}");
    IpcError::Fault
}

impl<M: AddressSpaceOps, C: ClockOps> Kernel<M, C> {
    /// Delivers `msg` to `dst`, or queues `caller` on `dst`'s caller queue.
    ///
    /// `m_ptr` is where the message stays while the caller is queued.
    pub(crate) fn mini_send(
        &mut self,
        caller: ProcNr,
        dst: ProcNr,
        msg: &Message,
        m_ptr: VirAddr,
        flags: IpcFlags,
    ) -> IpcResult {
        if self.would_deadlock(caller, dst) {
            log::warn!("mini_send: {caller} -> {dst} would deadlock");
            return Err(IpcError::Locked);
        }

        let target = &self.procs[dst];
        let waiting = target.rts & (RtsFlags::RECEIVING | RtsFlags::SENDING)
            == RtsFlags::RECEIVING
            && target.getfrom.accepts(caller)
            && !target.holds_reply();

        if waiting {
            let buf = target.messbuf;
            let delivered = msg.stamped(self.procs[caller].endpoint);
            self.mem
                .write_message(dst, buf, &delivered)
                .map_err(|err| copy_fault("mini_send", dst, err))?;
            self.procs[dst].getfrom = Peer::Any;
            self.unblock(dst, RtsFlags::RECEIVING);
            log::trace!("mini_send: {caller} -> {dst} delivered");
            return Ok(IpcOutcome::Completed);
        }

        if flags.contains(IpcFlags::NON_BLOCKING) {
            return Err(IpcError::NotReady);
        }

        let proc = &mut self.procs[caller];
        proc.messbuf = m_ptr;
        proc.sendto = Some(dst);
        self.block(caller, RtsFlags::SENDING);
        self.procs.append_caller(dst, caller);
        log::trace!("mini_send: {caller} queued on {dst}");
        Ok(IpcOutcome::Blocked)
    }

    /// Would `caller` sending to `dst` close a cycle of blocked senders?
    /// Sending to oneself counts as a cycle.
    fn would_deadlock(&self, caller: ProcNr, dst: ProcNr) -> bool {
        let mut cursor = dst;
        for _ in 0..=self.procs.capacity() {
            if cursor == caller {
                return true;
            }
            let p = &self.procs[cursor];
            match p.sendto {
                Some(next) if p.rts.contains(RtsFlags::SENDING) => cursor = next,
                _ => return false,
            }
        }
        false
    }

    /// Acquires a message for `caller` from a source accepted by `src`.
    pub(crate) fn mini_receive(
        &mut self,
        caller: ProcNr,
        src: Peer,
        m_ptr: VirAddr,
        flags: IpcFlags,
    ) -> IpcResult {
        let busy = self.is_sendrec_busy(caller);

        // Only REPLY may complete the receive half of a SENDREC.
        if busy && self.procs[caller].holds_reply() {
            self.wait_for_message(caller, src, m_ptr);
            return Ok(IpcOutcome::Blocked);
        }

        if !self.procs[caller].rts.contains(RtsFlags::SENDING) {
            if self.take_pending_notification(caller, src, m_ptr)? {
                return Ok(IpcOutcome::Completed);
            }

            let sender = self.procs.callers(caller).find(|&s| src.accepts(s));
            if let Some(sender) = sender {
                let queued = &self.procs[sender];
                let (buf, sender_ep) = (queued.messbuf, queued.endpoint);
                let msg = self
                    .mem
                    .read_message(sender, buf)
                    .map_err(|err| copy_fault("mini_receive", sender, err))?
                    .stamped(sender_ep);
                self.mem
                    .write_message(caller, m_ptr, &msg)
                    .map_err(|err| copy_fault("mini_receive", caller, err))?;

                self.procs.unlink_caller(caller, sender);
                self.procs[sender].sendto = None;
                self.unblock(sender, RtsFlags::SENDING);
                log::trace!("mini_receive: {caller} took message from {sender}");
                return Ok(IpcOutcome::Completed);
            }
        }

        if !flags.contains(IpcFlags::NON_BLOCKING) {
            self.wait_for_message(caller, src, m_ptr);
            return Ok(IpcOutcome::Blocked);
        }
        if busy {
            self.end_sendrec(caller);
        }
        Err(IpcError::NotReady)
    }

    fn wait_for_message(&mut self, caller: ProcNr, src: Peer, m_ptr: VirAddr) {
        let proc = &mut self.procs[caller];
        proc.getfrom = src;
        proc.messbuf = m_ptr;
        self.block(caller, RtsFlags::RECEIVING);
    }

    /// SEND to `dst`, then wait for its REPLY in the same buffer.
    ///
    /// If no reply object is free once the send half has committed, the
    /// message stays delivered (or queued) and the call fails with
    /// [`IpcError::NoReplyObject`]. The caller has no way to collect a
    /// reply for that message.
    pub(crate) fn do_sendrec(
        &mut self,
        caller: ProcNr,
        dst: ProcNr,
        msg: &Message,
        m_ptr: VirAddr,
        flags: IpcFlags,
    ) -> IpcResult {
        self.set_sendrec_busy(caller, true);
        if let Err(err) = self.mini_send(caller, dst, msg, m_ptr, flags) {
            self.set_sendrec_busy(caller, false);
            return Err(err);
        }

        let caller_ep = self.procs[caller].endpoint;
        let Some(ticket) = self.replies.allocate(caller, dst, caller_ep) else {
            log::warn!("sendrec: no reply object for {caller}, message to {dst} sent unanswered");
            self.set_sendrec_busy(caller, false);
            return Err(IpcError::NoReplyObject);
        };
        self.procs[caller].reply = Some(ticket);

        match self.mini_receive(caller, Peer::Proc(dst), m_ptr, flags) {
            Ok(IpcOutcome::Blocked) => Ok(IpcOutcome::Blocked),
            other => {
                self.end_sendrec(caller);
                other
            }
        }
    }

    fn set_sendrec_busy(&mut self, nr: ProcNr, busy: bool) {
        if let Some(record) = self.priv_of_mut(nr) {
            record.flags.set(PrivFlags::SENDREC_BUSY, busy);
        }
    }

    /// Completes the SENDREC of the caller named by `msg.m_type`.
    pub(crate) fn do_reply(&mut self, replier: ProcNr, msg: &Message) -> IpcResult {
        let caller_ep = msg.reply_to();
        let caller = self.procs.resolve(caller_ep).inspect_err(|_| {
            log::warn!("do_reply: {replier} answering stale endpoint {caller_ep}");
        })?;

        // The request must have been received before it can be answered.
        let waiting = &self.procs[caller];
        let in_reply_wait = waiting.rts & (RtsFlags::RECEIVING | RtsFlags::SENDING)
            == RtsFlags::RECEIVING
            && self.is_sendrec_busy(caller);
        let ticket = match waiting.reply.as_ref() {
            Some(ticket) if in_reply_wait => ticket,
            _ => {
                log::warn!("do_reply: {caller} is not waiting for a reply");
                return Err(IpcError::BadRequest);
            }
        };
        let Some(obj) = self.replies.get(ticket).copied() else {
            log::warn!("do_reply: reply object of {caller} is not in use");
            return Err(IpcError::BadRequest);
        };

        if obj.target != replier {
            log::warn!(
                "do_reply: {replier} may not answer {caller}, reply reserved for {}",
                obj.target
            );
            return Err(IpcError::PermissionDenied);
        }
        if obj.caller != caller || obj.caller_ep != caller_ep {
            log::warn!(
                "do_reply: endpoint mismatch, object has {} but reply names {caller_ep}",
                obj.caller_ep
            );
            return Err(IpcError::BadRequest);
        }

        let buf = waiting.messbuf;
        let answer = msg.stamped(self.procs[replier].endpoint);
        self.mem
            .write_message(caller, buf, &answer)
            .map_err(|err| copy_fault("do_reply", caller, err))?;

        self.end_sendrec(caller);
        self.procs[caller].getfrom = Peer::Any;
        self.unblock(caller, RtsFlags::RECEIVING);
        log::trace!("do_reply: {replier} answered {caller}");
        Ok(IpcOutcome::Completed)
    }

    /// Writes the caller's own message back into its buffer.
    pub(crate) fn do_echo(&mut self, caller: ProcNr, msg: &Message, m_ptr: VirAddr) -> IpcResult {
        let echoed = msg.stamped(self.procs[caller].endpoint);
        self.mem
            .write_message(caller, m_ptr, &echoed)
            .map_err(|err| copy_fault("do_echo", caller, err))?;
        Ok(IpcOutcome::Completed)
    }
}
