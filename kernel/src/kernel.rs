//! # Kernel Context
//!
//! [`Kernel`] owns every table the IPC core mutates: processes, privileges,
//! ready queues and reply objects, plus the two external collaborators
//! (address-space copy and clock). Holding `&mut Kernel` is what grants
//! exclusive access; there is no ambient global state.
//!
//! This module covers the lifecycle half of the context: boot from an image,
//! spawn into a free slot, exit, shutdown and clock ticks. The IPC
//! primitives are implemented in [`crate::ipc`].

use crate::config::{KernelConfig, MAX_USER_Q, MIN_USER_Q, NR_TASKS};
use crate::error::IpcError;
use crate::ipc::ReplyPool;
use crate::privilege::{Priv, PrivFlags, PrivTable, TrapMask};
use crate::process::{ImageEntry, ProcTable, Process, RtsFlags, SpawnError, BOOT_TASKS};
use crate::sched::Scheduler;
use crate::traits::{AddressSpaceOps, ClockOps};
use crate::types::{next_generation, Endpoint, Peer, ProcNr};

/// The process-management context.
pub struct Kernel<M, C> {
    pub(crate) config: KernelConfig,
    pub(crate) procs: ProcTable,
    pub(crate) privs: PrivTable,
    pub(crate) sched: Scheduler,
    pub(crate) replies: ReplyPool,
    pub(crate) mem: M,
    pub(crate) clock: C,
    pub(crate) shutdown_started: bool,
}

impl<M: AddressSpaceOps, C: ClockOps> Kernel<M, C> {
    /// Builds the tables, installs the kernel tasks followed by `image`, and
    /// makes every runnable process ready.
    pub fn boot(
        config: KernelConfig,
        image: &[ImageEntry<'_>],
        mem: M,
        clock: C,
    ) -> Result<Self, SpawnError> {
        config.validate()?;
        log::info!(
            "Booting IPC core: {} slots, {} privilege records, {} reply objects",
            config.table_size(),
            config.nr_sys_procs,
            config.reply_objects
        );

        let mut kernel = Self {
            config,
            procs: ProcTable::new(config.table_size()),
            privs: PrivTable::new(config.nr_sys_procs),
            sched: Scheduler::new(),
            replies: ReplyPool::new(config.reply_objects),
            mem,
            clock,
            shutdown_started: false,
        };

        for entry in &BOOT_TASKS {
            kernel.install(entry, 0)?;
            if let Some(record) = kernel.priv_of_mut(entry.nr) {
                record.ipc_to.fill(config.nr_sys_procs);
            }
        }
        // Stays out of the ready queues; it only ever appears as a
        // notification source.
        kernel.procs[ProcNr::from_raw(crate::config::HARDWARE as u16)].rts = RtsFlags::P_STOP;

        for entry in image {
            if entry.nr.is_task() {
                return Err(SpawnError::ReservedSlot(entry.nr));
            }
            kernel.install(entry, 0)?;
        }
        for entry in image {
            kernel.grant(entry)?;
        }

        for idx in 0..kernel.procs.capacity() {
            let nr = ProcNr::from_raw(idx as u16);
            if kernel.procs[nr].is_runnable() {
                kernel.enqueue(nr);
            }
        }
        kernel.sched.restart();

        log::debug!("Boot complete, {} processes installed", NR_TASKS + image.len());
        Ok(kernel)
    }

    /// Starts a new incarnation of a free slot. Returns its endpoint.
    pub fn spawn(&mut self, entry: &ImageEntry<'_>) -> Result<Endpoint, SpawnError> {
        let nr = entry.nr;
        if nr.is_task() {
            return Err(SpawnError::ReservedSlot(nr));
        }
        let generation = match self.procs.get(nr) {
            None => return Err(SpawnError::SlotOutOfRange(nr)),
            Some(p) if !p.is_free() => return Err(SpawnError::SlotInUse(nr)),
            Some(p) => next_generation(p.generation),
        };
        for &target in entry.send_to {
            if target != nr && !self.procs.get(target).is_some_and(|p| !p.is_free()) {
                return Err(SpawnError::BadTarget(target));
            }
        }

        self.install(entry, generation)?;
        self.grant(entry)?;
        self.enqueue(nr);

        let ep = self.procs[nr].endpoint;
        log::debug!("Spawned {} as {ep}", entry.name);
        Ok(ep)
    }

    fn install(&mut self, entry: &ImageEntry<'_>, generation: u32) -> Result<(), SpawnError> {
        let nr = entry.nr;
        let proc = self.procs.get(nr).ok_or(SpawnError::SlotOutOfRange(nr))?;
        if !proc.is_free() {
            return Err(SpawnError::SlotInUse(nr));
        }
        if !nr.is_task() && !(MAX_USER_Q..=MIN_USER_Q).contains(&entry.priority) {
            return Err(SpawnError::BadPriority(entry.priority));
        }

        let id = match proc.priv_id {
            Some(id) => id,
            None => self.privs.alloc(nr).ok_or(SpawnError::NoPrivilege(nr))?,
        };
        self.privs[id].reset(nr, entry.flags, entry.trap_mask);

        let proc = &mut self.procs[nr];
        proc.priv_id = Some(id);
        proc.install(entry, generation);
        log::trace!("install: slot {nr} '{}' priority {}", entry.name, entry.priority);
        Ok(())
    }

    /// Grants `entry`'s send targets. The grant is made symmetric when the
    /// target may do more than receive.
    fn grant(&mut self, entry: &ImageEntry<'_>) -> Result<(), SpawnError> {
        let src_id = self.procs[entry.nr]
            .priv_id
            .ok_or(SpawnError::NoPrivilege(entry.nr))?;

        for &target in entry.send_to {
            let dst_id = self
                .procs
                .get(target)
                .filter(|p| !p.is_free())
                .and_then(|p| p.priv_id)
                .ok_or(SpawnError::BadTarget(target))?;

            self.privs[src_id].ipc_to.set(dst_id);
            if !(self.privs[dst_id].trap_mask - TrapMask::RECEIVE).is_empty() {
                self.privs[dst_id].ipc_to.set(src_id);
            }
        }
        Ok(())
    }

    /// Termination hook. Tears down every IPC reference to `nr` and frees
    /// the slot.
    pub fn exit(&mut self, nr: ProcNr) -> Result<(), IpcError> {
        let proc = self.procs.get(nr).ok_or(IpcError::BadPeer)?;
        if proc.is_free() {
            return Err(IpcError::DeadDestination);
        }
        if nr.is_task() {
            return Err(IpcError::CallDenied);
        }

        self.block(nr, RtsFlags::SLOT_FREE);
        self.end_sendrec(nr);

        if let Some(dst) = self.blocked_sendto(nr) {
            self.procs.unlink_caller(dst, nr);
        }

        if let Some(id) = self.procs[nr].priv_id {
            for record in self.privs.iter_mut() {
                record.notify_pending.unset(id);
            }
            let record = &mut self.privs[id];
            record.notify_pending.clear();
            record.int_pending = 0;
            record.sig_pending = 0;
        }

        for idx in 0..self.procs.capacity() {
            let other = ProcNr::from_raw(idx as u16);
            if other == nr {
                continue;
            }
            let p = &self.procs[other];
            if p.is_free() {
                continue;
            }
            let sending = p.rts.contains(RtsFlags::SENDING) && p.sendto == Some(nr);
            let receiving = p.rts.contains(RtsFlags::RECEIVING) && p.getfrom == Peer::Proc(nr);
            if sending || receiving {
                self.wake_dead_peer(other);
            }
        }

        let proc = &mut self.procs[nr];
        proc.rts = RtsFlags::SLOT_FREE;
        proc.sendto = None;
        proc.getfrom = Peer::Any;
        proc.caller_q = None;
        proc.q_link = None;
        proc.next_ready = None;
        proc.wake_status = None;
        self.sched.forget(nr);

        log::debug!("exit: slot {nr} released");
        Ok(())
    }

    /// Unblocks a process that was waiting on a peer that died.
    fn wake_dead_peer(&mut self, nr: ProcNr) {
        if let Some(dst) = self.blocked_sendto(nr) {
            self.procs.unlink_caller(dst, nr);
        }
        self.end_sendrec(nr);

        let p = &mut self.procs[nr];
        p.sendto = None;
        p.wake_status = Some(IpcError::DeadSource);
        log::trace!("exit: waking {nr}, peer died");
        self.unblock(nr, RtsFlags::SENDING | RtsFlags::RECEIVING);
    }

    fn blocked_sendto(&self, nr: ProcNr) -> Option<ProcNr> {
        let p = &self.procs[nr];
        p.sendto.filter(|_| p.rts.contains(RtsFlags::SENDING))
    }

    /// Relaxes the dead-destination check for the rest of the kernel's life.
    pub fn begin_shutdown(&mut self) {
        log::info!("Shutdown started; sends to dead slots no longer rejected");
        self.shutdown_started = true;
    }

    /// Accounts one clock tick to the running process and preempts it when
    /// its quantum is used up.
    pub fn clock_tick(&mut self) {
        let Some(cur) = self.sched.current() else {
            return;
        };
        let flags = self.priv_of(cur).map_or(PrivFlags::empty(), |r| r.flags);

        self.procs[cur].user_time += 1;
        if !flags.contains(PrivFlags::BILLABLE) {
            if let Some(bill) = self.sched.bill() {
                self.procs[bill].sys_time += 1;
            }
        }

        if flags.contains(PrivFlags::PREEMPTIBLE) {
            let proc = &mut self.procs[cur];
            proc.ticks_left = proc.ticks_left.saturating_sub(1);
            if proc.ticks_left == 0 && proc.is_runnable() {
                log::trace!("clock: quantum of {cur} expired");
                self.sched.dequeue(&mut self.procs, &self.privs, cur);
                self.sched.enqueue(&mut self.procs, &self.privs, cur);
            }
        }
    }

    /// Publishes the scheduler's pick as the running process.
    pub fn restart(&mut self) -> Option<ProcNr> {
        self.sched.restart()
    }

    /// Makes a runnable process eligible to run.
    pub fn enqueue(&mut self, nr: ProcNr) {
        self.sched.enqueue(&mut self.procs, &self.privs, nr);
    }

    /// Removes a process from the ready queues.
    pub fn dequeue(&mut self, nr: ProcNr) {
        self.sched.dequeue(&mut self.procs, &self.privs, nr);
    }

    /// Result owed to `nr` for the call it was blocked in, if a peer's death
    /// cut that call short.
    pub fn take_wake_status(&mut self, nr: ProcNr) -> Option<IpcError> {
        self.procs.get_mut(nr).and_then(|p| p.wake_status.take())
    }

    /// Marks `nr` not runnable for `reason`, leaving the ready queues if it
    /// was runnable before.
    pub(crate) fn block(&mut self, nr: ProcNr, reason: RtsFlags) {
        let was_runnable = self.procs[nr].is_runnable();
        self.procs[nr].rts.insert(reason);
        if was_runnable {
            self.sched.dequeue(&mut self.procs, &self.privs, nr);
        }
        log::trace!("block: {nr} {:?}", self.procs[nr].rts);
    }

    /// Clears `reason`; re-enters the ready queues once nothing else blocks.
    pub(crate) fn unblock(&mut self, nr: ProcNr, reason: RtsFlags) {
        let proc = &mut self.procs[nr];
        if proc.is_runnable() {
            return;
        }
        proc.rts.remove(reason);
        if proc.is_runnable() {
            log::trace!("unblock: {nr}");
            self.sched.enqueue(&mut self.procs, &self.privs, nr);
        }
    }

    /// Releases the reply object `nr` holds and clears SENDREC_BUSY.
    pub(crate) fn end_sendrec(&mut self, nr: ProcNr) {
        if let Some(ticket) = self.procs[nr].reply.take() {
            self.replies.release(ticket);
        }
        if let Some(record) = self.priv_of_mut(nr) {
            record.flags.remove(PrivFlags::SENDREC_BUSY);
        }
    }

    /// Checks that `nr` names a live slot.
    pub(crate) fn live(&self, nr: ProcNr) -> Result<(), IpcError> {
        match self.procs.get(nr) {
            None => Err(IpcError::BadPeer),
            Some(p) if p.is_free() => Err(IpcError::DeadDestination),
            Some(_) => Ok(()),
        }
    }
}

impl<M, C> Kernel<M, C> {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub fn privs(&self) -> &PrivTable {
        &self.privs
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn replies(&self) -> &ReplyPool {
        &self.replies
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started
    }

    /// Process in slot `nr`, free or not.
    pub fn proc(&self, nr: ProcNr) -> Option<&Process> {
        self.procs.get(nr)
    }

    /// Current endpoint of a live slot.
    pub fn endpoint_of(&self, nr: ProcNr) -> Option<Endpoint> {
        self.procs.get(nr).filter(|p| !p.is_free()).map(|p| p.endpoint)
    }

    pub fn priv_of(&self, nr: ProcNr) -> Option<&Priv> {
        self.procs
            .get(nr)
            .and_then(|p| p.priv_id)
            .and_then(|id| self.privs.get(id))
    }

    pub(crate) fn priv_of_mut(&mut self, nr: ProcNr) -> Option<&mut Priv> {
        let id = self.procs.get(nr).and_then(|p| p.priv_id)?;
        self.privs.get_mut(id)
    }

    #[inline]
    pub(crate) fn is_sendrec_busy(&self, nr: ProcNr) -> bool {
        self.priv_of(nr).is_some_and(Priv::is_sendrec_busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CLOCK, IDLE, IDLE_Q, SYSTEM, USER_Q};
    use crate::invariants::check_all_invariants;
    use crate::traits::mock::{MockClock, MockMemory};

    type TestKernel = Kernel<MockMemory, MockClock>;

    fn nr(n: u16) -> ProcNr {
        ProcNr::from_raw(n)
    }

    fn user(n: u16, send_to: &'static [ProcNr]) -> ImageEntry<'static> {
        ImageEntry {
            nr: nr(n),
            name: "user",
            priority: USER_Q,
            quantum: 4,
            trap_mask: TrapMask::TASK,
            flags: PrivFlags::PREEMPTIBLE | PrivFlags::BILLABLE,
            send_to,
        }
    }

    fn boot(image: &[ImageEntry<'_>]) -> TestKernel {
        let config = KernelConfig::default().with_procs(8).with_sys_procs(12);
        Kernel::boot(config, image, MockMemory::new(), MockClock::new(0)).unwrap()
    }

    fn assert_consistent(k: &TestKernel) {
        let violations = check_all_invariants(k);
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn test_boot_installs_tasks_and_image() {
        static TARGETS: [ProcNr; 1] = [ProcNr::from_raw(5)];
        let k = boot(&[user(4, &TARGETS), user(5, &[])]);

        assert_eq!(k.proc(nr(IDLE as u16)).unwrap().priority, IDLE_Q);
        assert!(k.scheduler().is_queued(k.procs(), nr(CLOCK as u16)));
        assert!(!k.scheduler().is_queued(k.procs(), nr(3)));
        assert!(k.scheduler().is_queued(k.procs(), nr(4)));
        // Fresh quanta insert at the front, so the last task installed runs first.
        assert_eq!(k.scheduler().current(), Some(nr(SYSTEM as u16)));

        let p4 = k.priv_of(nr(4)).unwrap().id();
        let p5 = k.priv_of(nr(5)).unwrap().id();
        assert!(k.priv_of(nr(4)).unwrap().may_send_to(p5));
        // Symmetric because 5 may do more than receive.
        assert!(k.priv_of(nr(5)).unwrap().may_send_to(p4));
        assert!(k.priv_of(nr(SYSTEM as u16)).unwrap().may_send_to(p4));
        assert_consistent(&k);
    }

    #[test]
    fn test_grant_is_one_way_to_receive_only_target() {
        static TARGETS: [ProcNr; 1] = [ProcNr::from_raw(5)];
        let mut sink = user(5, &[]);
        sink.trap_mask = TrapMask::RECEIVE;
        let k = boot(&[user(4, &TARGETS), sink]);

        let p4 = k.priv_of(nr(4)).unwrap().id();
        let p5 = k.priv_of(nr(5)).unwrap().id();
        assert!(k.priv_of(nr(4)).unwrap().may_send_to(p5));
        assert!(!k.priv_of(nr(5)).unwrap().may_send_to(p4));
    }

    #[test]
    fn test_boot_rejects_bad_image() {
        let config = KernelConfig::default().with_procs(8).with_sys_procs(12);
        let boot = |image: &[ImageEntry<'_>]| {
            Kernel::boot(config, image, MockMemory::new(), MockClock::new(0)).err()
        };

        assert_eq!(boot(&[user(2, &[])]), Some(SpawnError::ReservedSlot(nr(2))));
        assert_eq!(boot(&[user(40, &[])]), Some(SpawnError::SlotOutOfRange(nr(40))));
        assert_eq!(
            boot(&[user(4, &[]), user(4, &[])]),
            Some(SpawnError::SlotInUse(nr(4)))
        );
        static MISSING: [ProcNr; 1] = [ProcNr::from_raw(6)];
        assert_eq!(boot(&[user(4, &MISSING)]), Some(SpawnError::BadTarget(nr(6))));

        let mut idle_prio = user(4, &[]);
        idle_prio.priority = IDLE_Q;
        assert_eq!(boot(&[idle_prio]), Some(SpawnError::BadPriority(IDLE_Q)));

        let tiny = KernelConfig::default().with_procs(8).with_sys_procs(NR_TASKS);
        assert_eq!(
            Kernel::boot(tiny, &[user(4, &[])], MockMemory::new(), MockClock::new(0)).err(),
            Some(SpawnError::NoPrivilege(nr(4)))
        );
    }

    #[test]
    fn test_user_priority_stays_within_user_queues() {
        let mut lowest = user(4, &[]);
        lowest.priority = MIN_USER_Q;
        let mut k = boot(&[lowest]);
        assert_eq!(k.proc(nr(4)).unwrap().max_priority, MIN_USER_Q);

        let mut below = user(5, &[]);
        below.priority = MIN_USER_Q + 1;
        assert_eq!(k.spawn(&below), Err(SpawnError::BadPriority(MIN_USER_Q + 1)));
        assert!(k.proc(nr(5)).unwrap().is_free());

        below.priority = MAX_USER_Q;
        assert!(k.spawn(&below).is_ok());
        assert_consistent(&k);
    }

    #[test]
    fn test_exit_then_spawn_bumps_generation() {
        let mut k = boot(&[user(4, &[])]);
        let old = k.endpoint_of(nr(4)).unwrap();

        k.exit(nr(4)).unwrap();
        assert!(k.proc(nr(4)).unwrap().is_free());
        assert!(!k.scheduler().is_queued(k.procs(), nr(4)));
        assert_eq!(k.endpoint_of(nr(4)), None);
        assert_eq!(k.exit(nr(4)), Err(IpcError::DeadDestination));

        let new = k.spawn(&user(4, &[])).unwrap();
        assert_eq!(new.slot(), nr(4));
        assert_eq!(new.generation(), old.generation() + 1);
        assert_eq!(k.procs().resolve(old), Err(IpcError::DeadDestination));
        assert_eq!(k.priv_of(nr(4)).unwrap().proc_nr, Some(nr(4)));
        assert_consistent(&k);
    }

    #[test]
    fn test_spawn_rejections() {
        let mut k = boot(&[user(4, &[])]);
        assert_eq!(k.spawn(&user(4, &[])), Err(SpawnError::SlotInUse(nr(4))));
        assert_eq!(k.spawn(&user(1, &[])), Err(SpawnError::ReservedSlot(nr(1))));
        assert_eq!(k.spawn(&user(99, &[])), Err(SpawnError::SlotOutOfRange(nr(99))));
        static DEAD: [ProcNr; 1] = [ProcNr::from_raw(7)];
        assert_eq!(k.spawn(&user(5, &DEAD)), Err(SpawnError::BadTarget(nr(7))));
        assert!(k.proc(nr(5)).unwrap().is_free());
    }

    #[test]
    fn test_exit_rejects_kernel_task() {
        let mut k = boot(&[]);
        assert_eq!(k.exit(nr(SYSTEM as u16)), Err(IpcError::CallDenied));
        assert_eq!(k.exit(nr(200)), Err(IpcError::BadPeer));
    }

    #[test]
    fn test_clock_tick_expires_quantum() {
        let mut k = boot(&[user(4, &[]), user(5, &[])]);
        k.block(nr(CLOCK as u16), RtsFlags::P_STOP);
        k.block(nr(SYSTEM as u16), RtsFlags::P_STOP);
        assert_eq!(k.restart(), Some(nr(5)));

        for _ in 0..3 {
            k.clock_tick();
        }
        assert_eq!(k.proc(nr(5)).unwrap().ticks_left, 1);
        assert_eq!(k.proc(nr(5)).unwrap().user_time, 3);
        assert_eq!(k.scheduler().next(), Some(nr(5)));

        k.clock_tick();
        let p5 = k.proc(nr(5)).unwrap();
        assert_eq!(p5.ticks_left, p5.quantum_size);
        assert_eq!(k.scheduler().next(), Some(nr(4)));
        assert_consistent(&k);
    }

    #[test]
    fn test_clock_tick_bills_system_time() {
        let mut k = boot(&[user(4, &[])]);
        k.block(nr(CLOCK as u16), RtsFlags::P_STOP);
        k.block(nr(SYSTEM as u16), RtsFlags::P_STOP);
        assert_eq!(k.restart(), Some(nr(4)));
        assert_eq!(k.scheduler().bill(), Some(nr(4)));

        k.unblock(nr(SYSTEM as u16), RtsFlags::P_STOP);
        assert_eq!(k.restart(), Some(nr(SYSTEM as u16)));
        k.clock_tick();
        k.clock_tick();

        assert_eq!(k.proc(nr(SYSTEM as u16)).unwrap().user_time, 2);
        assert_eq!(k.proc(nr(4)).unwrap().sys_time, 2);
        // Kernel tasks are not preemptible.
        let system = k.proc(nr(SYSTEM as u16)).unwrap();
        assert_eq!(system.ticks_left, system.quantum_size);
    }

    #[test]
    fn test_shutdown_flag() {
        let mut k = boot(&[]);
        assert!(!k.is_shutting_down());
        k.begin_shutdown();
        assert!(k.is_shutting_down());
    }
}
