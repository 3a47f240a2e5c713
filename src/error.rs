//! # Errors
//!
//! Two families:
//!
//! - [`Error`]: recoverable. Returned synchronously to the calling task;
//!   the kernel state is left exactly as it was before the call unless the
//!   variant says otherwise.
//! - [`Fatal`]: memory safety or a kernel invariant is in doubt. The
//!   scheduler stops dispatching and the fatal hook runs. No task code runs
//!   afterwards.

use core::fmt;

use crate::task::TaskId;

/// Recoverable kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A fixed-size table (tasks, mutexes, timers, channels, wait set) is
    /// full, or a requested stack is larger than a stack slot.
    CapacityExceeded,
    /// Ticket count rejected by the lottery policy.
    InvalidTicketCount,
    /// Mutex released by a task that does not own it. Ownership unchanged.
    NotOwner,
    /// A bounded wait expired. The caller was removed from the wait set.
    TimedOut,
    /// Acquire of a mutex the caller already owns. Mutexes are not reentrant.
    AlreadyOwned,
    /// Wait on a channel by a task other than its designated consumer.
    NotConsumer,
    /// Unknown or stale object identifier.
    NoSuchObject,
    /// The object is not in a state that permits the operation.
    BadState,
    /// The task is still referenced by a mutex or a channel.
    InUse,
    /// Blocking call from a context that must not block (idle task,
    /// scheduler not started, or a task other than the running one).
    BadContext,
    /// Malformed argument (zero period, zero counting limit, tiny stack).
    InvalidArgument,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::CapacityExceeded => "capacity exceeded",
            Error::InvalidTicketCount => "invalid ticket count",
            Error::NotOwner => "mutex not owned by caller",
            Error::TimedOut => "timed out",
            Error::AlreadyOwned => "mutex already owned by caller",
            Error::NotConsumer => "caller is not the channel consumer",
            Error::NoSuchObject => "no such object",
            Error::BadState => "bad object state",
            Error::InUse => "task still referenced",
            Error::BadContext => "operation not allowed in this context",
            Error::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}

/// Kind of unrecoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// A task's stack canary was overwritten.
    StackOverflow,
    /// Internal bookkeeping is inconsistent.
    InvariantViolation,
}

/// Context handed to the fatal hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fatal {
    pub kind: FatalKind,
    /// Offending task, if one can be blamed.
    pub task: Option<TaskId>,
    /// Name of the offending task, or `""`.
    pub name: &'static str,
}

impl Fatal {
    pub const fn new(kind: FatalKind, task: Option<TaskId>, name: &'static str) -> Self {
        Self { kind, task, name }
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            FatalKind::StackOverflow => "stack overflow",
            FatalKind::InvariantViolation => "kernel invariant violated",
        };
        match self.task {
            Some(id) => write!(f, "{} in task {} ({})", what, id, self.name),
            None => f.write_str(what),
        }
    }
}

/// Fatal-condition hook. Logs and then halts or resets.
pub type FatalHook = fn(&Fatal) -> !;
