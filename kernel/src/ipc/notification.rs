//! Notifications
//!
//! NOTIFY never blocks the notifier. If the destination is waiting for the
//! notifier it receives a synthesized message right away; otherwise the
//! notifier's bit is set in the destination's pending bitmap and the next
//! RECEIVE turns it into a message. Pending bits coalesce: any number of
//! notifications from one source before the next RECEIVE deliver once.
//!
//! HARDWARE and SYSTEM are pseudo-sources. Their notifications carry the
//! destination's pending interrupt and signal sets, which are cleared on
//! delivery.

use super::transfer::copy_fault;
use super::{Message, NotifyPayload};
use crate::config::{HARDWARE, SYSTEM};
use crate::error::{IpcError, IpcOutcome, IpcResult};
use crate::kernel::Kernel;
use crate::process::RtsFlags;
use crate::traits::{AddressSpaceOps, ClockOps};
use crate::types::{Peer, ProcNr, VirAddr};

const HARDWARE_NR: ProcNr = ProcNr::from_raw(HARDWARE as u16);
const SYSTEM_NR: ProcNr = ProcNr::from_raw(SYSTEM as u16);

impl<M: AddressSpaceOps, C: ClockOps> Kernel<M, C> {
    /// Notifies `dst` on behalf of `caller`. `badge` only survives immediate
    /// delivery.
    pub(crate) fn mini_notify(&mut self, caller: ProcNr, dst: ProcNr, badge: u64) -> IpcResult {
        let target = &self.procs[dst];
        let waiting = target.rts & (RtsFlags::RECEIVING | RtsFlags::SENDING)
            == RtsFlags::RECEIVING
            && !self.is_sendrec_busy(dst)
            && target.getfrom.accepts(caller);

        if waiting {
            let buf = target.messbuf;
            let msg = self.build_notification(caller, dst, badge);
            self.mem
                .write_message(dst, buf, &msg)
                .map_err(|err| copy_fault("mini_notify", dst, err))?;
            self.consume_pending(caller, dst);
            self.procs[dst].getfrom = Peer::Any;
            self.unblock(dst, RtsFlags::RECEIVING);
            log::trace!("mini_notify: {caller} -> {dst} delivered");
            return Ok(IpcOutcome::Completed);
        }

        let src_id = self.procs[caller].priv_id.ok_or(IpcError::CallDenied)?;
        let record = self.priv_of_mut(dst).ok_or(IpcError::DeadDestination)?;
        record.notify_pending.set(src_id);
        if badge != 0 {
            log::warn!("mini_notify: {dst} not waiting, badge {badge:#x} from {caller} dropped");
        }
        log::trace!("mini_notify: {caller} -> {dst} pending");
        Ok(IpcOutcome::Completed)
    }

    fn build_notification(&self, src: ProcNr, dst: ProcNr, badge: u64) -> Message {
        let record = self.priv_of(dst);
        let interrupts = match record {
            Some(r) if src == HARDWARE_NR => r.int_pending,
            _ => 0,
        };
        let sigset = match record {
            Some(r) if src == SYSTEM_NR => r.sig_pending,
            _ => 0,
        };
        NotifyPayload {
            timestamp: self.clock.uptime(),
            badge,
            interrupts,
            sigset,
        }
        .into_message(src, self.procs[src].endpoint)
    }

    /// Clears the pseudo-source state a delivered notification reported.
    fn consume_pending(&mut self, src: ProcNr, dst: ProcNr) {
        let Some(record) = self.priv_of_mut(dst) else {
            return;
        };
        if src == HARDWARE_NR {
            record.int_pending = 0;
        } else if src == SYSTEM_NR {
            record.sig_pending = 0;
        }
    }

    /// Delivers the lowest-numbered pending notification accepted by `src`.
    /// Notifications from SYSTEM pass any filter. Returns whether one was
    /// delivered.
    pub(super) fn take_pending_notification(
        &mut self,
        caller: ProcNr,
        src: Peer,
        m_ptr: VirAddr,
    ) -> Result<bool, IpcError> {
        let Some(record) = self.priv_of(caller) else {
            return Ok(false);
        };
        let found = record.notify_pending.iter().find_map(|id| {
            let notifier = self.privs.get(id)?.proc_nr?;
            (src.accepts(notifier) || notifier == SYSTEM_NR).then_some((id, notifier))
        });
        let Some((id, notifier)) = found else {
            return Ok(false);
        };

        let msg = self.build_notification(notifier, caller, 0);
        self.mem
            .write_message(caller, m_ptr, &msg)
            .map_err(|err| copy_fault("mini_receive", caller, err))?;

        if let Some(record) = self.priv_of_mut(caller) {
            record.notify_pending.unset(id);
        }
        self.consume_pending(notifier, caller);
        log::trace!("mini_receive: {caller} took pending notification from {notifier}");
        Ok(true)
    }

    /// Records interrupt `irq` for `dst` and notifies it from HARDWARE.
    pub fn raise_interrupt(&mut self, dst: ProcNr, irq: u32) -> IpcResult {
        if irq >= u32::BITS {
            return Err(IpcError::BadRequest);
        }
        self.live(dst)?;
        let record = self.priv_of_mut(dst).ok_or(IpcError::DeadDestination)?;
        record.int_pending |= 1 << irq;
        self.mini_notify(HARDWARE_NR, dst, 0)
    }

    /// Records signal `sig` for `dst` and notifies it from SYSTEM.
    pub fn raise_signal(&mut self, dst: ProcNr, sig: u32) -> IpcResult {
        if sig >= u64::BITS {
            return Err(IpcError::BadRequest);
        }
        self.live(dst)?;
        let record = self.priv_of_mut(dst).ok_or(IpcError::DeadDestination)?;
        record.sig_pending |= 1 << sig;
        self.mini_notify(SYSTEM_NR, dst, 0)
    }
}
