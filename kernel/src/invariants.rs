//! Runtime-checkable invariants
//!
//! Structural properties of the kernel tables that must hold between any two
//! primitives. Tests assert them after every step; the `sched-check` feature
//! runs the ready-queue subset after every scheduler mutation.
//!
//! # Invariants
//!
//! 1. **Ready-queue membership**: a process is on exactly one ready queue iff
//!    its run-state is empty, and that queue is the one its priority names
//! 2. **Ready-queue tails**: each queue's tail is its last member
//! 3. **Caller queues**: every member is SENDING to the queue's owner, and
//!    every blocked sender is a member of its target's queue
//! 4. **Reply accounting**: every held ticket names an in-use object that
//!    records its holder, the holder is SENDREC-busy, and the pool's in-use
//!    count equals the number of held tickets

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::NR_SCHED_QUEUES;
use crate::kernel::Kernel;
use crate::privilege::Priv;
use crate::process::{ProcTable, RtsFlags};
use crate::sched::Scheduler;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants<M, C>(kernel: &Kernel<M, C>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_ready_queues(kernel.scheduler(), kernel.procs()));
    violations.extend(check_caller_queues(kernel.procs()));
    violations.extend(check_reply_accounting(kernel));

    violations
}

/// Invariants 1 and 2
pub fn check_ready_queues(sched: &Scheduler, procs: &ProcTable) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut seen = vec![0usize; procs.capacity()];

    for q in 0..NR_SCHED_QUEUES as u8 {
        let mut last = None;
        for nr in sched.queue(procs, q) {
            last = Some(nr);
            let Some(p) = procs.get(nr) else {
                violations.push(InvariantViolation {
                    invariant: "ready_queue_membership",
                    description: alloc::format!("queue {q} links unknown slot {nr}"),
                });
                continue;
            };
            seen[nr.as_index()] += 1;
            if p.priority != q {
                violations.push(InvariantViolation {
                    invariant: "ready_queue_membership",
                    description: alloc::format!(
                        "process {nr} with priority {} is on queue {q}",
                        p.priority
                    ),
                });
            }
        }
        if last != sched.tail(q) {
            violations.push(InvariantViolation {
                invariant: "ready_queue_tail",
                description: alloc::format!(
                    "queue {q} ends at {last:?} but its tail is {:?}",
                    sched.tail(q)
                ),
            });
        }
    }

    for p in procs.iter() {
        let count = seen[p.nr.as_index()];
        let expected = usize::from(p.is_runnable());
        if count != expected {
            violations.push(InvariantViolation {
                invariant: "ready_queue_membership",
                description: alloc::format!(
                    "process {} with run-state {:?} is on {count} queues",
                    p.nr,
                    p.rts
                ),
            });
        }
    }

    violations
}

/// Invariant 3
fn check_caller_queues(procs: &ProcTable) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for owner in procs.iter() {
        for sender in procs.callers(owner.nr) {
            let p = &procs[sender];
            if !p.rts.contains(RtsFlags::SENDING) || p.sendto != Some(owner.nr) {
                violations.push(InvariantViolation {
                    invariant: "caller_queue",
                    description: alloc::format!(
                        "process {sender} is queued on {} but sends to {:?} ({:?})",
                        owner.nr,
                        p.sendto,
                        p.rts
                    ),
                });
            }
        }
    }

    for p in procs.iter().filter(|p| p.rts.contains(RtsFlags::SENDING)) {
        let queued = p
            .sendto
            .is_some_and(|dst| procs.callers(dst).any(|nr| nr == p.nr));
        if !queued {
            violations.push(InvariantViolation {
                invariant: "caller_queue",
                description: alloc::format!(
                    "process {} is SENDING to {:?} but not on its caller queue",
                    p.nr,
                    p.sendto
                ),
            });
        }
    }

    violations
}

/// Invariant 4
fn check_reply_accounting<M, C>(kernel: &Kernel<M, C>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut held = 0;

    for p in kernel.procs().iter() {
        let Some(ticket) = p.reply.as_ref() else {
            continue;
        };
        held += 1;

        if !kernel.priv_of(p.nr).is_some_and(Priv::is_sendrec_busy) {
            violations.push(InvariantViolation {
                invariant: "reply_accounting",
                description: alloc::format!("process {} holds a ticket but is not busy", p.nr),
            });
        }
        match kernel.replies().get(ticket) {
            None => violations.push(InvariantViolation {
                invariant: "reply_accounting",
                description: alloc::format!(
                    "process {} holds released object {}",
                    p.nr,
                    ticket.index()
                ),
            }),
            Some(obj) if obj.caller != p.nr || obj.caller_ep != p.endpoint => {
                violations.push(InvariantViolation {
                    invariant: "reply_accounting",
                    description: alloc::format!(
                        "object {} records caller {} ({}) but is held by {} ({})",
                        ticket.index(),
                        obj.caller,
                        obj.caller_ep,
                        p.nr,
                        p.endpoint
                    ),
                });
            }
            Some(_) => {}
        }
    }

    let in_use = kernel.replies().in_use();
    if in_use != held {
        violations.push(InvariantViolation {
            invariant: "reply_accounting",
            description: alloc::format!("{in_use} reply objects in use, {held} tickets held"),
        });
    }

    violations
}
