//! Error taxonomy for the execution core.
//!
//! Two families live here. [`VmError`] covers conditions a running thread can
//! observe and unwind from: stack exhaustion, asynchronous raise/kill requests
//! and deferred out-of-memory. [`ProtocolViolation`] covers misuse of the
//! scheduler or collector contracts; it always indicates a bug in the caller.

use thiserror::Error;

use crate::value::Value;

/// Conditions surfaced to the interpreter loop as exceptions or termination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// The native stack probe found no headroom left.
    #[error("stack overflow: {remaining} bytes of headroom remaining")]
    StackOverflow {
        /// Signed headroom at the time of the check (always `<= 0`).
        remaining: isize,
    },

    /// Another thread asked this thread to raise an exception.
    #[error("asynchronous exception raised by another thread")]
    Raised(Value),

    /// Another thread asked this thread to terminate.
    #[error("thread killed")]
    Killed,

    /// An allocation could not be satisfied; reported at the next checkpoint.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Size of the allocation request that failed.
        requested: usize,
    },

    /// A wait or stop request gave up after its retry budget.
    #[error("timed out waiting for {0}")]
    WaitTimeout(&'static str),

    /// The runtime contract was broken by the caller.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

impl VmError {
    /// Whether this error was delivered asynchronously from another thread.
    #[must_use]
    pub const fn is_async_interrupt(&self) -> bool {
        matches!(self, Self::Raised(_) | Self::Killed)
    }
}

/// A scheduler or collector used one of the core protocols incorrectly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// The fiber state machine has no edge between these states.
    #[error("illegal fiber transition from {from:?} to {to:?}")]
    IllegalFiberTransition {
        /// State observed when the transition was attempted.
        from: crate::context::FiberTransition,
        /// State that was requested.
        to: crate::context::FiberTransition,
    },

    /// `collect_start` was called while a cycle was already open.
    #[error("collect_start called while cycle {open} is still open")]
    CycleAlreadyOpen {
        /// Cycle number of the bracket that is still open.
        open: u64,
    },

    /// `collect_roots` or `collect_finish` was called with no open cycle.
    #[error("{operation} called outside a collect_start/collect_finish bracket")]
    NoOpenCycle {
        /// Name of the offending operation.
        operation: &'static str,
    },

    /// `collect_finish` named a different cycle than the one that is open.
    #[error("collect_finish for cycle {got} but cycle {open} is open")]
    CycleMismatch {
        /// Cycle that is open.
        open: u64,
        /// Cycle passed to `collect_finish`.
        got: u64,
    },

    /// A managed-only operation ran while the thread was not Managed.
    #[error("{operation} requires the Managed phase")]
    NotManaged {
        /// Name of the offending operation.
        operation: &'static str,
    },

    /// `pop_call_frame` was called on an empty frame stack.
    #[error("pop_call_frame on an empty call-frame stack")]
    EmptyFrameStack,

    /// A stop was requested by a thread that already owns the stop.
    #[error("stop_the_world re-entered by its owner")]
    StopReentered,

    /// The stack size is not larger than the reserved cushion.
    #[error("stack size {size} does not exceed the {cushion}-byte cushion")]
    StackTooSmall {
        /// Requested stack size.
        size: usize,
        /// Configured cushion.
        cushion: usize,
    },
}

/// Convenience alias used across the crate.
pub type Result<T, E = VmError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FiberTransition;

    #[test]
    fn test_async_interrupt_classification() {
        assert!(VmError::Killed.is_async_interrupt());
        assert!(VmError::Raised(Value::from_int(1)).is_async_interrupt());
        assert!(!VmError::OutOfMemory { requested: 8 }.is_async_interrupt());
        assert!(!VmError::StackOverflow { remaining: 0 }.is_async_interrupt());
    }

    #[test]
    fn test_protocol_violation_converts_and_displays() {
        let err: VmError = ProtocolViolation::IllegalFiberTransition {
            from: FiberTransition::Finished,
            to: FiberTransition::Running,
        }
        .into();
        assert!(matches!(err, VmError::Protocol(_)));
        assert_eq!(
            err.to_string(),
            "illegal fiber transition from Finished to Running"
        );
    }
}
