use std::fmt;

/// Classes of unrecoverable scheduler misuse.
///
/// These are programmer errors, not runtime conditions. Capacity problems
/// (an exhausted memory pool) are never reported through this type; they
/// surface as a null [`Future`](crate::Future) instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// A spawn was issued with neither a scheduler nor a dependency future
    /// to resolve one from.
    MissingScheduler,

    /// An operation was requested from an execution context that cannot
    /// honor it, e.g. a respawn requested by a non-leader team rank.
    WrongContext,

    /// `Future::get` was called on a null future.
    NullFutureGet,

    /// The task protocol was violated, e.g. reading a result through a
    /// future whose value type does not match the task, or reading it
    /// before the task completed.
    ProtocolViolation,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::MissingScheduler => "missing scheduler",
            FaultKind::WrongContext => "wrong context",
            FaultKind::NullFutureGet => "get on null future",
            FaultKind::ProtocolViolation => "protocol violation",
        };
        f.write_str(name)
    }
}

/// Terminates the process with a diagnostic.
///
/// Structural violations are not recoverable: by the time one is observed
/// the task graph can no longer be trusted.
#[cold]
#[track_caller]
pub(crate) fn fatal(kind: FaultKind, msg: &str) -> ! {
    panic!("FATAL: scheduler fault ({kind}): {msg}");
}
