//! # Kernel Configuration
//!
//! Compile-time constants that fix the shape of the process table and the
//! scheduler, plus [`KernelConfig`], the runtime sizing handed to
//! [`Kernel::boot`](crate::kernel::Kernel::boot).

use thiserror::Error;

use crate::types::Endpoint;

/// Number of kernel-task slots at the front of the process table.
pub const NR_TASKS: usize = 4;

/// Slot of the idle task.
pub const IDLE: usize = 0;
/// Slot of the clock task.
pub const CLOCK: usize = 1;
/// Slot of the system task. Its notifications carry pending signals.
pub const SYSTEM: usize = 2;
/// Pseudo-slot used as the source of interrupt notifications.
pub const HARDWARE: usize = 3;

/// Number of ready queues.
pub const NR_SCHED_QUEUES: usize = 16;
/// Queue of kernel tasks.
pub const TASK_Q: u8 = 0;
/// Highest queue a user process may reach.
pub const MAX_USER_Q: u8 = 0;
/// Default queue for user processes.
pub const USER_Q: u8 = 7;
/// Lowest queue a user process may sink to.
pub const MIN_USER_Q: u8 = 14;
/// Queue of the idle task; nothing else ever lands here.
pub const IDLE_Q: u8 = (NR_SCHED_QUEUES - 1) as u8;

/// Upper bound on processes holding a privilege record.
pub const MAX_SYS_PROCS: usize = 256;

/// Capacity of a process name.
pub const P_NAME_LEN: usize = 16;

/// Quantum, in ticks, given to processes that do not specify one.
pub const DEFAULT_QUANTUM: u32 = 8;

/// Largest number of user slots whose endpoints cannot collide with the
/// `ANY`/`NONE` sentinels.
pub const MAX_PROCS: usize = Endpoint::NONE.as_raw() as usize - NR_TASKS;

/// Configuration validation failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("process table must hold at least one user slot")]
    NoUserSlots,
    #[error("process table of {0} slots exceeds the endpoint encoding")]
    TooManyProcs(usize),
    #[error("privilege table of {0} records exceeds MAX_SYS_PROCS")]
    TooManySysProcs(usize),
    #[error("privilege table too small for the kernel tasks")]
    NoSysProcs,
    #[error("reply pool must hold at least one object")]
    NoReplyObjects,
}

/// Runtime sizing of the kernel tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// User slots, not counting the [`NR_TASKS`] kernel tasks.
    pub nr_procs: usize,
    /// Privilege records, including those of the kernel tasks.
    pub nr_sys_procs: usize,
    /// Capacity of the reply-object pool.
    pub reply_objects: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            nr_procs: 64,
            nr_sys_procs: 32,
            reply_objects: 64 + NR_TASKS,
        }
    }
}

impl KernelConfig {
    pub fn with_procs(mut self, nr_procs: usize) -> Self {
        self.nr_procs = nr_procs;
        self
    }

    pub fn with_sys_procs(mut self, nr_sys_procs: usize) -> Self {
        self.nr_sys_procs = nr_sys_procs;
        self
    }

    pub fn with_reply_objects(mut self, reply_objects: usize) -> Self {
        self.reply_objects = reply_objects;
        self
    }

    /// Total process-table capacity, kernel tasks included.
    #[inline]
    pub fn table_size(&self) -> usize {
        NR_TASKS + self.nr_procs
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_procs == 0 {
            return Err(ConfigError::NoUserSlots);
        }
        if self.nr_procs > MAX_PROCS {
            return Err(ConfigError::TooManyProcs(self.nr_procs));
        }
        if self.nr_sys_procs > MAX_SYS_PROCS {
            return Err(ConfigError::TooManySysProcs(self.nr_sys_procs));
        }
        if self.nr_sys_procs < NR_TASKS {
            return Err(ConfigError::NoSysProcs);
        }
        if self.reply_objects == 0 {
            return Err(ConfigError::NoReplyObjects);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_queue_layout() {
        assert!(TASK_Q <= MAX_USER_Q);
        assert!(MAX_USER_Q < USER_Q);
        assert!(USER_Q < MIN_USER_Q);
        assert!(MIN_USER_Q < IDLE_Q);
        assert_eq!(IDLE_Q as usize, NR_SCHED_QUEUES - 1);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.with_procs(0).validate(), Err(ConfigError::NoUserSlots));
        assert_eq!(
            cfg.with_procs(MAX_PROCS + 1).validate(),
            Err(ConfigError::TooManyProcs(MAX_PROCS + 1))
        );
        assert_eq!(
            cfg.with_sys_procs(MAX_SYS_PROCS + 1).validate(),
            Err(ConfigError::TooManySysProcs(MAX_SYS_PROCS + 1))
        );
        assert_eq!(cfg.with_sys_procs(2).validate(), Err(ConfigError::NoSysProcs));
        assert_eq!(
            cfg.with_reply_objects(0).validate(),
            Err(ConfigError::NoReplyObjects)
        );
    }

    #[test]
    fn test_table_size_counts_tasks() {
        assert_eq!(KernelConfig::default().with_procs(10).table_size(), 14);
    }
}
