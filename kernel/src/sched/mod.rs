//! Scheduler subsystem
//!
//! ## Features
//!
//! - `NR_SCHED_QUEUES` ready queues, index 0 highest
//! - FIFO within a queue, intrusive links through the process table
//! - Multilevel feedback: a process that burns two quanta back to back is
//!   demoted one level, one that does not climbs back toward its maximum
//! - A process preempted with time left re-enters at the front of its queue
//!
//! The scheduler never allocates and never inspects IPC state. It is told
//! when a process becomes runnable (`enqueue`) or stops being runnable
//! (`dequeue`) and republishes the next process to run after each change.

use crate::config::{MIN_USER_Q, NR_SCHED_QUEUES};
use crate::privilege::{PrivFlags, PrivTable};
use crate::process::{Process, ProcTable};
use crate::types::ProcNr;

/// Ready queues plus the picks published to context-switch code.
#[derive(Debug)]
pub struct Scheduler {
    rdy_head: [Option<ProcNr>; NR_SCHED_QUEUES],
    rdy_tail: [Option<ProcNr>; NR_SCHED_QUEUES],
    /// Last process to use up a full quantum
    prev: Option<ProcNr>,
    next: Option<ProcNr>,
    bill: Option<ProcNr>,
    current: Option<ProcNr>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            rdy_head: [None; NR_SCHED_QUEUES],
            rdy_tail: [None; NR_SCHED_QUEUES],
            prev: None,
            next: None,
            bill: None,
            current: None,
        }
    }

    /// Process chosen to run next.
    #[inline]
    pub fn next(&self) -> Option<ProcNr> {
        self.next
    }

    /// Process whose account is charged for system time.
    #[inline]
    pub fn bill(&self) -> Option<ProcNr> {
        self.bill
    }

    /// Process currently running.
    #[inline]
    pub fn current(&self) -> Option<ProcNr> {
        self.current
    }

    /// Switches to the published pick.
    pub fn restart(&mut self) -> Option<ProcNr> {
        self.current = self.next;
        self.current
    }

    #[inline]
    pub fn head(&self, q: u8) -> Option<ProcNr> {
        self.rdy_head.get(q as usize).copied().flatten()
    }

    #[inline]
    pub fn tail(&self, q: u8) -> Option<ProcNr> {
        self.rdy_tail.get(q as usize).copied().flatten()
    }

    /// Members of queue `q`, front to back.
    pub fn queue<'a>(&self, procs: &'a ProcTable, q: u8) -> impl Iterator<Item = ProcNr> + 'a {
        let mut cursor = self.head(q);
        let mut budget = procs.capacity();
        core::iter::from_fn(move || {
            let nr = cursor?;
            if budget == 0 {
                return None;
            }
            budget -= 1;
            cursor = procs.get(nr).and_then(|p| p.next_ready);
            Some(nr)
        })
    }

    /// Is `nr` linked into the queue its priority names?
    pub fn is_queued(&self, procs: &ProcTable, nr: ProcNr) -> bool {
        procs
            .get(nr)
            .is_some_and(|p| self.queue(procs, p.priority).any(|q| q == nr))
    }

    /// Adds a runnable process to the ready queues.
    pub fn enqueue(&mut self, procs: &mut ProcTable, privs: &PrivTable, nr: ProcNr) {
        match procs.get(nr) {
            Some(p) if p.is_runnable() => {}
            _ => {
                log::warn!("enqueue: process {nr} is not runnable");
                return;
            }
        }
        if self.is_queued(procs, nr) {
            log::warn!("enqueue: process {nr} already queued");
            return;
        }

        let (q, front) = self.sched(&mut procs[nr]);
        let qi = q as usize;
        match self.rdy_head[qi] {
            None => {
                self.rdy_head[qi] = Some(nr);
                self.rdy_tail[qi] = Some(nr);
                procs[nr].next_ready = None;
            }
            Some(head) if front => {
                procs[nr].next_ready = Some(head);
                self.rdy_head[qi] = Some(nr);
            }
            Some(_) => {
                if let Some(tail) = self.rdy_tail[qi] {
                    procs[tail].next_ready = Some(nr);
                }
                self.rdy_tail[qi] = Some(nr);
                procs[nr].next_ready = None;
            }
        }
        log::trace!("enqueue: process {nr} on queue {q} (front: {front})");

        self.pick_proc(procs, privs);
        self.check(procs);
    }

    /// Removes a process from its ready queue.
    pub fn dequeue(&mut self, procs: &mut ProcTable, privs: &PrivTable, nr: ProcNr) {
        let Some(q) = procs.get(nr).map(|p| p.priority as usize) else {
            return;
        };
        if q >= NR_SCHED_QUEUES {
            return;
        }

        let mut prev: Option<ProcNr> = None;
        let mut cursor = self.rdy_head[q];
        let mut budget = procs.capacity();
        while let Some(cur) = cursor {
            if budget == 0 {
                break;
            }
            budget -= 1;
            if cur == nr {
                let next = procs[cur].next_ready.take();
                match prev {
                    None => self.rdy_head[q] = next,
                    Some(p) => procs[p].next_ready = next,
                }
                if self.rdy_tail[q] == Some(nr) {
                    self.rdy_tail[q] = prev;
                }
                log::trace!("dequeue: process {nr} from queue {q}");
                break;
            }
            prev = cursor;
            cursor = procs[cur].next_ready;
        }

        if Some(nr) == self.current || Some(nr) == self.next {
            self.pick_proc(procs, privs);
        }
        self.check(procs);
    }

    /// Feedback policy. Returns the queue to use and whether to insert at
    /// its front.
    fn sched(&mut self, p: &mut Process) -> (u8, bool) {
        let time_left = p.ticks_left > 0;
        let mut penalty: i16 = 0;

        if !time_left {
            p.ticks_left = p.quantum_size;
            if self.prev == Some(p.nr) {
                penalty += 1;
            } else {
                penalty -= 1;
            }
            self.prev = Some(p.nr);
        }

        if penalty != 0 && !p.nr.is_task() {
            let floor = (MIN_USER_Q as i16).max(p.max_priority as i16);
            let prio = (p.priority as i16 + penalty).clamp(p.max_priority as i16, floor);
            p.priority = prio as u8;
        }

        (p.priority, time_left)
    }

    /// Publishes the head of the highest non-empty queue as next to run.
    pub fn pick_proc(&mut self, procs: &ProcTable, privs: &PrivTable) {
        self.next = self.rdy_head.iter().flatten().next().copied();
        if let Some(nr) = self.next {
            let billable = procs
                .get(nr)
                .and_then(|p| p.priv_id)
                .and_then(|id| privs.get(id))
                .is_some_and(|record| record.flags.contains(PrivFlags::BILLABLE));
            if billable {
                self.bill = Some(nr);
            }
            log::trace!("pick_proc: next {nr}");
        }
    }

    /// Drops every reference to a slot that is being freed.
    pub(crate) fn forget(&mut self, nr: ProcNr) {
        if self.prev == Some(nr) {
            self.prev = None;
        }
        if self.bill == Some(nr) {
            self.bill = None;
        }
        if self.current == Some(nr) {
            self.current = None;
        }
    }

    #[cfg(feature = "sched-check")]
    fn check(&self, procs: &ProcTable) {
        for violation in crate::invariants::check_ready_queues(self, procs) {
            log::warn!("sched-check: {}: {}", violation.invariant, violation.description);
        }
    }

    #[cfg(not(feature = "sched-check"))]
    #[inline(always)]
    fn check(&self, _procs: &ProcTable) {}
}
