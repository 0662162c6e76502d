//! IPC error taxonomy.
//!
//! Every failed call surfaces one of these to the caller as a negative result
//! code. Rejections during validation leave no trace in kernel state.

use thiserror::Error;

/// Outcome of a successful IPC primitive.
///
/// Blocking is not an error: the caller simply observes the eventual
/// delivery once the scheduler runs it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum IpcOutcome {
    /// The call finished without suspending the caller.
    Completed,
    /// The caller is no longer runnable and waits for a peer.
    Blocked,
}

impl IpcOutcome {
    #[inline]
    pub fn is_blocked(self) -> bool {
        matches!(self, IpcOutcome::Blocked)
    }
}

/// Errors returned by the dispatch core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Trap mask or IPC send-mask forbids the call.
    #[error("call denied by IPC policy")]
    CallDenied,
    /// Peer identifier is neither a valid slot nor `ANY`.
    #[error("invalid source or destination")]
    BadPeer,
    /// Destination slot is free or its endpoint is stale.
    #[error("destination is dead")]
    DeadDestination,
    /// The send would close a cycle of blocked senders.
    #[error("send would deadlock")]
    Locked,
    /// A non-blocking call could not complete immediately.
    #[error("peer not ready")]
    NotReady,
    /// The reply-object pool is exhausted.
    #[error("no reply object available")]
    NoReplyObject,
    /// Replier is not the process the reply object names.
    #[error("not permitted to reply")]
    PermissionDenied,
    /// Reply does not match a caller waiting for it.
    #[error("bad reply request")]
    BadRequest,
    /// Unknown call number.
    #[error("bad system call")]
    BadCall,
    /// A message buffer could not be read or written.
    #[error("bad message address")]
    Fault,
    /// Peer terminated while the caller was blocked on it.
    #[error("peer died")]
    DeadSource,
}

impl IpcError {
    /// Negative result code written into the trap frame.
    pub const fn errno(self) -> i64 {
        match self {
            IpcError::PermissionDenied => -1,
            IpcError::Fault => -14,
            IpcError::NoReplyObject => -28,
            IpcError::Locked => -101,
            IpcError::BadCall => -102,
            IpcError::BadPeer => -103,
            IpcError::CallDenied => -104,
            IpcError::DeadDestination => -105,
            IpcError::NotReady => -106,
            IpcError::BadRequest => -107,
            IpcError::DeadSource => -108,
        }
    }
}

/// Result type of every IPC primitive.
pub type IpcResult = Result<IpcOutcome, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [IpcError; 11] = [
        IpcError::CallDenied,
        IpcError::BadPeer,
        IpcError::DeadDestination,
        IpcError::Locked,
        IpcError::NotReady,
        IpcError::NoReplyObject,
        IpcError::PermissionDenied,
        IpcError::BadRequest,
        IpcError::BadCall,
        IpcError::Fault,
        IpcError::DeadSource,
    ];

    #[test]
    fn test_errno_is_negative_and_distinct() {
        for (i, a) in ALL.iter().enumerate() {
            assert!(a.errno() < 0);
            for b in &ALL[i + 1..] {
                assert_ne!(a.errno(), b.errno(), "{a:?} and {b:?} share a code");
            }
        }
    }

    #[test]
    fn test_blocked_outcome() {
        assert!(IpcOutcome::Blocked.is_blocked());
        assert!(!IpcOutcome::Completed.is_blocked());
    }
}
