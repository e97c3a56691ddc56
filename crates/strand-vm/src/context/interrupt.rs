//! Asynchronous interrupt bookkeeping.
//!
//! Other threads never unwind a thread directly. They record intent here,
//! under the control block's interrupt spinlock, and the owning thread turns
//! that intent into an unwind the next time it checks.

use crate::error::VmError;
use crate::value::Value;

/// Flags guarded by the interrupt spinlock. Every operation is O(1).
#[derive(Debug, Default)]
pub struct InterruptFlags {
    /// An interrupt is pending and the owner should look at the other flags.
    pub check_local_interrupts: bool,
    /// Termination was requested.
    pub interrupt_by_kill: bool,
    /// A signal handler asked the thread to look at its signal queue.
    pub interrupt_with_signal: bool,
    /// Single-step mode requested by a debugger.
    pub thread_step: bool,
    /// Exception to raise, set by `register_raise`.
    pub interrupted_exception: Option<Value>,
}

impl InterruptFlags {
    /// Turn a pending raise or kill into an unwind, clearing it.
    ///
    /// Kill wins over raise. Returns `None` when nothing is pending, and in
    /// that case also drops the `check_local_interrupts` hint unless single
    /// stepping keeps it on.
    pub fn take_pending(&mut self) -> Option<VmError> {
        if self.interrupt_by_kill {
            self.interrupt_by_kill = false;
            self.interrupted_exception = None;
            self.settle();
            return Some(VmError::Killed);
        }
        if let Some(exc) = self.interrupted_exception.take() {
            self.settle();
            return Some(VmError::Raised(exc));
        }
        self.settle();
        None
    }

    /// Acknowledge a signal interrupt. Returns whether one was pending.
    pub const fn take_signal(&mut self) -> bool {
        let pending = self.interrupt_with_signal;
        self.interrupt_with_signal = false;
        self.settle();
        pending
    }

    const fn settle(&mut self) {
        self.check_local_interrupts = self.thread_step || self.interrupt_with_signal;
    }
}

/// Why the owning thread is currently unwinding.
#[derive(Debug, Default)]
pub struct ThreadState {
    pending: Option<VmError>,
}

impl ThreadState {
    /// Record an unwind; the first reason recorded wins.
    pub fn raise(&mut self, err: VmError) {
        if self.pending.is_none() {
            self.pending = Some(err);
        }
    }

    /// Whether an unwind is in progress.
    #[must_use]
    pub const fn is_unwinding(&self) -> bool {
        self.pending.is_some()
    }

    /// The pending unwind, if any.
    #[must_use]
    pub const fn pending(&self) -> Option<&VmError> {
        self.pending.as_ref()
    }

    /// Take the pending unwind, leaving the thread in its normal state.
    pub fn take(&mut self) -> Option<VmError> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_takes_priority_over_raise() {
        let mut flags = InterruptFlags {
            check_local_interrupts: true,
            interrupt_by_kill: true,
            interrupted_exception: Some(Value::from_int(1)),
            ..InterruptFlags::default()
        };
        assert_eq!(flags.take_pending(), Some(VmError::Killed));
        assert!(flags.interrupted_exception.is_none());
        assert!(!flags.check_local_interrupts);
        assert_eq!(flags.take_pending(), None);
    }

    #[test]
    fn test_raise_delivered_once() {
        let mut flags = InterruptFlags {
            check_local_interrupts: true,
            interrupted_exception: Some(Value::from_symbol(3)),
            ..InterruptFlags::default()
        };
        assert_eq!(
            flags.take_pending(),
            Some(VmError::Raised(Value::from_symbol(3)))
        );
        assert_eq!(flags.take_pending(), None);
    }

    #[test]
    fn test_thread_step_keeps_checking_enabled() {
        let mut flags = InterruptFlags {
            check_local_interrupts: true,
            thread_step: true,
            ..InterruptFlags::default()
        };
        assert_eq!(flags.take_pending(), None);
        assert!(flags.check_local_interrupts);
    }

    #[test]
    fn test_first_unwind_reason_wins() {
        let mut state = ThreadState::default();
        state.raise(VmError::Killed);
        state.raise(VmError::OutOfMemory { requested: 1 });
        assert_eq!(state.take(), Some(VmError::Killed));
        assert!(!state.is_unwinding());
    }
}
