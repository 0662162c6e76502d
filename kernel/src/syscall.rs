//! System call interface
//!
//! Decodes the trap frame of an IPC call, runs it through the dispatch core
//! and writes the result code back. The register layout is fixed by the
//! architecture entry stub:
//!
//! | register  | content                                        |
//! |-----------|------------------------------------------------|
//! | `call_nr` | function (bits 0-3) and [`IpcFlags`] (bits 4-7) |
//! | `src_dst` | peer endpoint, or `ANY`                        |
//! | `m_ptr`   | message buffer in the caller's address space   |
//! | `result`  | `0` on success, a negative code on failure     |

use crate::error::{IpcError, IpcResult};
use crate::ipc::{Call, IpcFlags};
use crate::kernel::Kernel;
use crate::traits::{AddressSpaceOps, ClockOps};
use crate::types::{Endpoint, ProcNr, VirAddr};

/// Saved registers for syscall
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallRegs {
    pub call_nr: u64,
    pub src_dst: u64,
    pub m_ptr: u64,
    pub result: i64,
}

impl SyscallRegs {
    /// Frame of a `call` with `flags` on `src_dst` and the buffer at `m_ptr`.
    pub fn new(call: Call, flags: IpcFlags, src_dst: Endpoint, m_ptr: VirAddr) -> Self {
        Self {
            call_nr: u64::from(call.with_flags(flags)),
            src_dst: src_dst.as_raw() as u32 as u64,
            m_ptr: m_ptr.as_usize() as u64,
            result: 0,
        }
    }

    #[inline]
    pub fn call_word(&self) -> u32 {
        self.call_nr as u32
    }

    #[inline]
    pub fn peer(&self) -> Endpoint {
        Endpoint::from_raw(self.src_dst as u32 as i32)
    }

    #[inline]
    pub fn buffer(&self) -> VirAddr {
        VirAddr::new(self.m_ptr as usize)
    }
}

/// Encodes an IPC result as a trap return value.
#[inline]
pub fn result_code(result: IpcResult) -> i64 {
    match result {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}

/// System call handler (called from arch-specific entry)
///
/// A call that blocks reports `0` now; if a peer's death later cuts it
/// short, [`resume_status`] rewrites the frame before the caller resumes.
pub fn syscall_handler<M: AddressSpaceOps, C: ClockOps>(
    kernel: &mut Kernel<M, C>,
    caller: ProcNr,
    regs: &mut SyscallRegs,
) -> IpcResult {
    let result = kernel.sys_call(caller, regs.call_word(), regs.peer(), regs.buffer());
    regs.result = result_code(result);
    result
}

/// Applies the result owed to `nr` for a call that was interrupted while it
/// was blocked. Called on the way back to user mode.
pub fn resume_status<M: AddressSpaceOps, C: ClockOps>(
    kernel: &mut Kernel<M, C>,
    nr: ProcNr,
    regs: &mut SyscallRegs,
) -> Option<IpcError> {
    let status = kernel.take_wake_status(nr)?;
    regs.result = status.errno();
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, USER_Q};
    use crate::error::IpcOutcome;
    use crate::ipc::Message;
    use crate::privilege::{PrivFlags, TrapMask};
    use crate::process::ImageEntry;
    use crate::traits::mock::{MockClock, MockMemory};

    type TestKernel = Kernel<MockMemory, MockClock>;

    static PEERS: [ProcNr; 1] = [ProcNr::from_raw(5)];

    fn nr(n: u16) -> ProcNr {
        ProcNr::from_raw(n)
    }

    fn boot(mask_4: TrapMask) -> TestKernel {
        let entry = |n: u16, trap_mask, send_to: &'static [ProcNr]| ImageEntry {
            nr: nr(n),
            name: "proc",
            priority: USER_Q,
            quantum: 4,
            trap_mask,
            flags: PrivFlags::PREEMPTIBLE | PrivFlags::BILLABLE,
            send_to,
        };
        let image = [entry(4, mask_4, &PEERS), entry(5, TrapMask::TASK, &[])];
        let config = KernelConfig::default().with_procs(8).with_sys_procs(12);
        Kernel::boot(config, &image, MockMemory::new(), MockClock::new(0)).unwrap()
    }

    fn ep_addr() -> VirAddr {
        VirAddr::new(0x80)
    }

    #[test]
    fn test_register_encoding() {
        let ep = Endpoint::new(3, nr(5));
        let regs = SyscallRegs::new(Call::Send, IpcFlags::NON_BLOCKING, ep, VirAddr::new(0x40));
        assert_eq!(regs.call_nr, 0x11);
        assert_eq!(regs.peer(), ep);
        assert_eq!(regs.buffer(), VirAddr::new(0x40));

        let any = SyscallRegs::new(Call::Receive, IpcFlags::empty(), Endpoint::ANY, ep_addr());
        assert!(any.peer().is_any());
        assert_eq!(any.call_word(), 2);
    }

    #[test]
    fn test_handler_writes_result_code() {
        let mut k = boot(TrapMask::USER);
        let ep5 = k.endpoint_of(nr(5)).unwrap();

        let mut regs = SyscallRegs::new(Call::Send, IpcFlags::empty(), ep5, VirAddr::new(0x10));
        assert_eq!(syscall_handler(&mut k, nr(4), &mut regs), Err(IpcError::CallDenied));
        assert_eq!(regs.result, IpcError::CallDenied.errno());

        let mut regs =
            SyscallRegs::new(Call::Echo, IpcFlags::empty(), Endpoint::NONE, VirAddr::new(0x10));
        k.mem_mut().put(nr(4), VirAddr::new(0x10), Message::new(77, &[5]));
        assert_eq!(syscall_handler(&mut k, nr(4), &mut regs), Ok(IpcOutcome::Completed));
        assert_eq!(regs.result, 0);
    }

    #[test]
    fn test_unknown_function_is_bad_call() {
        let mask = TrapMask::from_bits_retain(TrapMask::TASK.bits() | 1 << 6);
        let mut k = boot(mask);
        let ep5 = k.endpoint_of(nr(5)).unwrap();

        let mut regs = SyscallRegs {
            call_nr: 6,
            src_dst: ep5.as_raw() as u64,
            m_ptr: 0,
            result: 0,
        };
        assert_eq!(syscall_handler(&mut k, nr(4), &mut regs), Err(IpcError::BadCall));
        assert_eq!(regs.result, IpcError::BadCall.errno());

        // Without the trap bit the mask check comes first.
        regs.call_nr = 7;
        assert_eq!(syscall_handler(&mut k, nr(4), &mut regs), Err(IpcError::CallDenied));
    }

    #[test]
    fn test_blocked_call_reports_peer_death_on_resume() {
        let mut k = boot(TrapMask::TASK);
        let ep5 = k.endpoint_of(nr(5)).unwrap();

        let mut regs = SyscallRegs::new(Call::SendRec, IpcFlags::empty(), ep5, VirAddr::new(0x10));
        assert_eq!(syscall_handler(&mut k, nr(4), &mut regs), Ok(IpcOutcome::Blocked));
        assert_eq!(regs.result, 0);
        assert_eq!(resume_status(&mut k, nr(4), &mut regs), None);

        k.exit(nr(5)).unwrap();
        assert_eq!(resume_status(&mut k, nr(4), &mut regs), Some(IpcError::DeadSource));
        assert_eq!(regs.result, IpcError::DeadSource.errno());
        assert!(k.proc(nr(4)).unwrap().is_runnable());
        assert_eq!(k.replies().in_use(), 0);
    }
}
