//! # Serialized Kernel Entry
//!
//! The dispatch core takes `&mut Kernel` and so never locks anything itself.
//! Code that reaches the kernel from outside the trap path (interrupt
//! handlers, kernel tasks) goes through a [`KernelLock`], which owns the
//! kernel and hands out exclusive access one primitive at a time.
//!
//! The lock also publishes the kernel entry depth: `-1` while nobody is
//! inside, `0` while a guard is held. Nested entry is refused rather than
//! counted: [`KernelLock::try_enter`] returns `None` and
//! [`KernelLock::enter`] spins until the holder leaves, so the depth never
//! exceeds `0`.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, Ordering};

use spin::{Mutex, MutexGuard};

use crate::error::IpcResult;
use crate::ipc::{copy_fault, IpcFlags};
use crate::kernel::Kernel;
use crate::traits::{AddressSpaceOps, ClockOps};
use crate::types::{ProcNr, VirAddr};

/// Owner of the kernel context for gateway entry points.
pub struct KernelLock<M, C> {
    kernel: Mutex<Kernel<M, C>>,
    k_reenter: AtomicI32,
}

/// Exclusive access to the kernel for the lifetime of the guard.
pub struct KernelGuard<'a, M, C> {
    kernel: MutexGuard<'a, Kernel<M, C>>,
    depth: &'a AtomicI32,
    site: &'static str,
}

impl<M, C> KernelLock<M, C> {
    pub const fn new(kernel: Kernel<M, C>) -> Self {
        Self {
            kernel: Mutex::new(kernel),
            k_reenter: AtomicI32::new(-1),
        }
    }

    /// Enters the kernel on behalf of `site`, spinning until it is free.
    pub fn enter(&self, site: &'static str) -> KernelGuard<'_, M, C> {
        let kernel = self.kernel.lock();
        self.guard(kernel, site)
    }

    /// Enters the kernel only if nobody else is inside.
    pub fn try_enter(&self, site: &'static str) -> Option<KernelGuard<'_, M, C>> {
        let kernel = self.kernel.try_lock()?;
        Some(self.guard(kernel, site))
    }

    fn guard<'a>(
        &'a self,
        kernel: MutexGuard<'a, Kernel<M, C>>,
        site: &'static str,
    ) -> KernelGuard<'a, M, C> {
        let depth = self.k_reenter.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("{site}: enter kernel, depth {depth}");
        KernelGuard {
            kernel,
            depth: &self.k_reenter,
            site,
        }
    }

    /// `-1` when no one is inside, `0` while a guard is held.
    #[inline]
    pub fn reenter_depth(&self) -> i32 {
        self.k_reenter.load(Ordering::Acquire)
    }

    pub fn into_inner(self) -> Kernel<M, C> {
        self.kernel.into_inner()
    }
}

impl<M: AddressSpaceOps, C: ClockOps> KernelLock<M, C> {
    /// Notifies `dst` on behalf of `src` without a badge.
    pub fn lock_notify(&self, src: ProcNr, dst: ProcNr) -> IpcResult {
        let mut k = self.enter("lock_notify");
        k.live(src)?;
        k.live(dst)?;
        k.mini_notify(src, dst, 0)
    }

    /// Non-blocking SEND of the message at `m_ptr`. Fails with
    /// [`NotReady`](crate::IpcError::NotReady) unless `dst` is waiting for
    /// `caller`.
    pub fn lock_send(&self, caller: ProcNr, dst: ProcNr, m_ptr: VirAddr) -> IpcResult {
        let mut k = self.enter("lock_send");
        k.live(caller)?;
        k.live(dst)?;
        let msg = k
            .mem
            .read_message(caller, m_ptr)
            .map_err(|err| copy_fault("lock_send", caller, err))?;
        k.mini_send(caller, dst, &msg, m_ptr, IpcFlags::NON_BLOCKING)
    }

    pub fn lock_enqueue(&self, nr: ProcNr) {
        self.enter("lock_enqueue").enqueue(nr);
    }

    pub fn lock_dequeue(&self, nr: ProcNr) {
        self.enter("lock_dequeue").dequeue(nr);
    }

    /// Runs `f` with the kernel held.
    pub fn with<R>(&self, site: &'static str, f: impl FnOnce(&mut Kernel<M, C>) -> R) -> R {
        f(&mut *self.enter(site))
    }
}

impl<M, C> Deref for KernelGuard<'_, M, C> {
    type Target = Kernel<M, C>;

    fn deref(&self) -> &Kernel<M, C> {
        &self.kernel
    }
}

impl<M, C> DerefMut for KernelGuard<'_, M, C> {
    fn deref_mut(&mut self) -> &mut Kernel<M, C> {
        &mut self.kernel
    }
}

impl<M, C> Drop for KernelGuard<'_, M, C> {
    fn drop(&mut self) {
        let depth = self.depth.fetch_sub(1, Ordering::AcqRel);
        log::trace!("{}: leave kernel, depth {depth}", self.site);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, USER_Q};
    use crate::error::{IpcError, IpcOutcome};
    use crate::invariants::check_all_invariants;
    use crate::ipc::Message;
    use crate::privilege::{PrivFlags, TrapMask};
    use crate::process::{ImageEntry, RtsFlags};
    use crate::traits::mock::{MockClock, MockMemory};
    use crate::types::Endpoint;

    type TestLock = KernelLock<MockMemory, MockClock>;

    static PEERS_4: [ProcNr; 1] = [ProcNr::from_raw(5)];

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

    fn lock() -> TestLock {
        let config = KernelConfig::default().with_procs(8).with_sys_procs(12);
        let image = [user(4, &PEERS_4), user(5, &[])];
        let kernel = Kernel::boot(config, &image, MockMemory::new(), MockClock::new(0)).unwrap();
        KernelLock::new(kernel)
    }

    #[test]
    fn test_reentry_depth() {
        let lock = lock();
        assert_eq!(lock.reenter_depth(), -1);
        {
            let _k = lock.enter("test");
            assert_eq!(lock.reenter_depth(), 0);
            assert!(lock.try_enter("nested").is_none());
            // A refused entry leaves no trace in the depth.
            assert_eq!(lock.reenter_depth(), 0);
        }
        assert_eq!(lock.reenter_depth(), -1);
        assert!(lock.try_enter("again").is_some());
        assert_eq!(lock.reenter_depth(), -1);
    }

    #[test]
    fn test_lock_send_never_blocks() {
        let lock = lock();
        let buf = VirAddr::new(0x100);
        lock.with("setup", |k| k.mem_mut().put(nr(4), buf, Message::new(9, &[1])));

        assert_eq!(lock.lock_send(nr(4), nr(5), buf), Err(IpcError::NotReady));
        lock.with("check", |k| {
            assert!(k.proc(nr(4)).unwrap().is_runnable());
            assert_eq!(k.procs().callers(nr(5)).count(), 0);
        });

        let inbox = VirAddr::new(0x200);
        lock.with("receive", |k| {
            let r = k.receive(nr(5), Endpoint::ANY, inbox, IpcFlags::empty());
            assert_eq!(r, Ok(IpcOutcome::Blocked));
        });
        assert_eq!(lock.lock_send(nr(4), nr(5), buf), Ok(IpcOutcome::Completed));

        let k = lock.into_inner();
        let got = k.mem().peek(nr(5), inbox).unwrap();
        assert_eq!(got.m_type, 9);
        assert_eq!(got.source, k.endpoint_of(nr(4)).unwrap());
        assert!(check_all_invariants(&k).is_empty());
    }

    #[test]
    fn test_lock_notify_and_scheduling_gateways() {
        let lock = lock();
        assert_eq!(lock.lock_notify(nr(4), nr(5)), Ok(IpcOutcome::Completed));
        assert_eq!(lock.lock_notify(nr(4), nr(6)), Err(IpcError::DeadDestination));
        assert_eq!(lock.lock_notify(nr(4), nr(60)), Err(IpcError::BadPeer));

        lock.with("stop", |k| k.procs[nr(5)].rts.insert(RtsFlags::P_STOP));
        lock.lock_dequeue(nr(5));
        lock.with("check", |k| {
            assert!(!k.scheduler().is_queued(k.procs(), nr(5)));
            let p4 = k.priv_of(nr(4)).unwrap().id();
            assert!(k.priv_of(nr(5)).unwrap().notify_pending.get(p4));
            assert!(check_all_invariants(k).is_empty());
        });

        lock.with("resume", |k| k.procs[nr(5)].rts.remove(RtsFlags::P_STOP));
        lock.lock_enqueue(nr(5));
        let k = lock.into_inner();
        assert!(k.scheduler().is_queued(k.procs(), nr(5)));
        assert!(check_all_invariants(&k).is_empty());
    }
}
