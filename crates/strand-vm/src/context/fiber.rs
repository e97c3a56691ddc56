//! Fiber transition state machine.
//!
//! ```text
//! Running -> Suspending -> Suspended -> Resuming -> Running
//! Running | Suspended -> Canceled -> Finished
//! ```
//!
//! The flag is an atomic so other threads can observe it without taking the
//! fiber wait mutex. The mutex and condition variable in the control block
//! are only the physical parking mechanism.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ProtocolViolation;

/// Logical state of the fiber running on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberTransition {
    /// Executing normally.
    Running = 0,
    /// Asked to yield; not yet parked.
    Suspending = 1,
    /// Parked on the fiber wait condition.
    Suspended = 2,
    /// Another party signalled intent to resume.
    Resuming = 3,
    /// Cancelled from outside; must finish.
    Canceled = 4,
    /// Terminal.
    Finished = 5,
}

impl FiberTransition {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Suspending,
            2 => Self::Suspended,
            3 => Self::Resuming,
            4 => Self::Canceled,
            _ => Self::Finished,
        }
    }

    /// Whether the state machine has an edge from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Running, Self::Suspending)
                | (Self::Suspending, Self::Suspended)
                | (Self::Suspended, Self::Resuming)
                | (Self::Resuming, Self::Running)
                | (Self::Running | Self::Suspended, Self::Canceled)
                | (Self::Canceled, Self::Finished)
        )
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// How a suspended fiber came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberWake {
    /// Resumed; the fiber is `Running` again.
    Resumed,
    /// Cancelled; the fiber must unwind and call `fiber_finish`.
    Canceled,
}

/// Atomically updated [`FiberTransition`], readable without the wait mutex.
#[derive(Debug)]
pub struct FiberFlag(AtomicU8);

impl FiberFlag {
    /// A flag in the initial `Running` state.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(FiberTransition::Running as u8))
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn get(&self) -> FiberTransition {
        FiberTransition::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if the current state has an edge to it.
    ///
    /// Returns the state that was replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolViolation::IllegalFiberTransition`] when there is no
    /// edge from the observed state to `to`.
    pub fn transition(&self, to: FiberTransition) -> Result<FiberTransition, ProtocolViolation> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = FiberTransition::from_u8(current);
            if !from.can_transition_to(to) {
                return Err(ProtocolViolation::IllegalFiberTransition { from, to });
            }
            match self
                .0
                .compare_exchange_weak(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(from),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for FiberFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FiberTransition::{Canceled, Finished, Resuming, Running, Suspended, Suspending};

    const ALL: [FiberTransition; 6] = [Running, Suspending, Suspended, Resuming, Canceled, Finished];

    #[test]
    fn test_only_documented_edges_are_legal() {
        let legal = [
            (Running, Suspending),
            (Suspending, Suspended),
            (Suspended, Resuming),
            (Resuming, Running),
            (Running, Canceled),
            (Suspended, Canceled),
            (Canceled, Finished),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn test_finished_has_no_outgoing_edges() {
        assert!(Finished.is_terminal());
        assert!(ALL.iter().all(|&to| !Finished.can_transition_to(to)));
    }

    #[test]
    fn test_flag_walks_full_cycle() {
        let flag = FiberFlag::new();
        assert_eq!(flag.get(), Running);
        assert_eq!(flag.transition(Suspending), Ok(Running));
        assert_eq!(flag.transition(Suspended), Ok(Suspending));
        assert_eq!(flag.transition(Resuming), Ok(Suspended));
        assert_eq!(flag.transition(Running), Ok(Resuming));
        assert_eq!(flag.transition(Canceled), Ok(Running));
        assert_eq!(flag.transition(Finished), Ok(Canceled));
        assert_eq!(
            flag.transition(Running),
            Err(ProtocolViolation::IllegalFiberTransition {
                from: Finished,
                to: Running
            })
        );
        assert_eq!(flag.get(), Finished);
    }

    #[test]
    fn test_rejected_transition_leaves_state_untouched() {
        let flag = FiberFlag::new();
        assert!(flag.transition(Resuming).is_err());
        assert_eq!(flag.get(), Running);
    }
}
