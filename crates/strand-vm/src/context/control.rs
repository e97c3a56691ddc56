//! The shared half of an execution context.
//!
//! A [`ThreadControlBlock`] is what the nexus registry and other threads hold.
//! It carries everything that may be touched from outside the owning thread:
//! the phase, the fiber flag, interrupt requests and the wait primitives.
//! [`ContextHandle`] is the public face of it.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use super::fiber::{FiberFlag, FiberTransition};
use super::frame::FrameStack;
use super::interrupt::InterruptFlags;
use crate::error::ProtocolViolation;
use crate::metrics::ContextMetrics;
use crate::spinlock::SpinLock;
use crate::value::Value;
use crate::wait::{Channel, Park};

/// Opaque identifier of a registered context. Never zero.
pub type ThreadId = u32;

/// Whether a context may touch managed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadPhase {
    /// Running managed code; must reach checkpoints.
    Managed = 0,
    /// Promised not to touch managed memory; excluded from stop waits.
    Unmanaged = 1,
    /// Blocked at a checkpoint until the current stop is released.
    Parked = 2,
}

impl ThreadPhase {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Managed,
            1 => Self::Unmanaged,
            _ => Self::Parked,
        }
    }
}

/// What a context is currently blocked on, for [`ContextHandle::wakeup`].
#[derive(Default)]
pub(crate) enum Waiter {
    #[default]
    None,
    Channel(Arc<Channel>),
    Custom(Arc<dyn Fn() + Send + Sync>),
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Channel(_) => f.write_str("Channel"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Rendezvous {
    pub(crate) waiter: Waiter,
    pub(crate) object: Option<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) checkpoints: AtomicU64,
    pub(crate) stops: AtomicU64,
    pub(crate) samples: AtomicU64,
}

/// Shared per-thread state, reference-counted between the owning
/// [`ExecutionContext`](super::ExecutionContext), the nexus registry and any
/// [`ContextHandle`]s.
pub struct ThreadControlBlock {
    id: ThreadId,
    name: String,
    phase: AtomicU8,
    pub(crate) fiber: FiberFlag,
    pub(crate) fiber_wait: Mutex<()>,
    pub(crate) fiber_cond: Condvar,
    pub(crate) interrupts: SpinLock<InterruptFlags>,
    /// Mirror of `interrupts.check_local_interrupts`, readable without the lock.
    check_interrupts: AtomicBool,
    pub(crate) park: Park,
    pub(crate) rendezvous: Mutex<Rendezvous>,
    sleeping: AtomicBool,
    pub(crate) zombie: AtomicBool,
    pub(crate) counters: CachePadded<Counters>,
    frames: UnsafeCell<FrameStack>,
}

// SAFETY: `frames` is the only field without its own synchronization. It is
// mutated only by the owning thread while Managed, and read by another thread
// only through a `StoppedWorld`, which exists only while the owner is Parked
// or Unmanaged and therefore not touching its frames.
unsafe impl Sync for ThreadControlBlock {}
// SAFETY: every field is `Send`; `FrameStack` holds `Value`s, which are plain words.
unsafe impl Send for ThreadControlBlock {}

impl ThreadControlBlock {
    pub(crate) fn new(id: ThreadId, name: String, spin_budget: std::time::Duration) -> Self {
        Self {
            id,
            name,
            phase: AtomicU8::new(ThreadPhase::Unmanaged as u8),
            fiber: FiberFlag::new(),
            fiber_wait: Mutex::new(()),
            fiber_cond: Condvar::new(),
            interrupts: SpinLock::with_budget(InterruptFlags::default(), spin_budget),
            check_interrupts: AtomicBool::new(false),
            park: Park::new(),
            rendezvous: Mutex::new(Rendezvous::default()),
            sleeping: AtomicBool::new(false),
            zombie: AtomicBool::new(false),
            counters: CachePadded::new(Counters::default()),
            frames: UnsafeCell::new(FrameStack::new()),
        }
    }

    /// Registry id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// Name given at registration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> ThreadPhase {
        ThreadPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Phase stores are `SeqCst` so they order against the nexus stop flag.
    #[inline]
    pub(crate) fn set_phase(&self, phase: ThreadPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Whether local interrupt checking is switched on.
    #[inline]
    pub(crate) fn interrupt_pending(&self) -> bool {
        self.check_interrupts.load(Ordering::Acquire)
    }

    /// Whether a raise or kill should end the current wait.
    ///
    /// Signal and single-step interrupts keep checking switched on but do
    /// not cut waits short.
    pub(crate) fn wants_wakeup(&self) -> bool {
        if !self.interrupt_pending() {
            return false;
        }
        let flags = self.interrupts.lock();
        flags.interrupt_by_kill || flags.interrupted_exception.is_some()
    }

    /// Run `f` on the interrupt flags and republish the fast-path hint.
    pub(crate) fn with_interrupts<R>(&self, f: impl FnOnce(&mut InterruptFlags) -> R) -> R {
        let mut flags = self.interrupts.lock();
        let out = f(&mut flags);
        self.check_interrupts
            .store(flags.check_local_interrupts, Ordering::Release);
        out
    }

    /// Shared view of the frame stack.
    ///
    /// # Safety
    ///
    /// The caller is the owning thread, or holds a `StoppedWorld` that
    /// excludes the owner.
    pub(crate) unsafe fn frames(&self) -> &FrameStack {
        // SAFETY: upheld by the caller.
        unsafe { &*self.frames.get() }
    }

    /// Exclusive view of the frame stack.
    ///
    /// # Safety
    ///
    /// As for [`Self::frames`], and no other reference to the stack is live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frames_mut(&self) -> &mut FrameStack {
        // SAFETY: upheld by the caller.
        unsafe { &mut *self.frames.get() }
    }

    pub(crate) fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
    }

    pub(crate) fn metrics(&self) -> ContextMetrics {
        ContextMetrics {
            id: self.id,
            phase: self.phase(),
            fiber: self.fiber.get(),
            checkpoints: self.counters.checkpoints.load(Ordering::Relaxed),
            stops: self.counters.stops.load(Ordering::Relaxed),
            samples: self.counters.samples.load(Ordering::Relaxed),
            sleeping: self.sleeping.load(Ordering::Acquire),
        }
    }
}

impl fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControlBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &self.phase())
            .field("fiber", &self.fiber.get())
            .finish_non_exhaustive()
    }
}

/// A cloneable, thread-safe reference to someone else's execution context.
///
/// Handles can request interrupts, wake waits and drive the fiber state
/// machine. They never see frames.
#[derive(Clone, Debug)]
pub struct ContextHandle {
    tcb: Arc<ThreadControlBlock>,
}

impl ContextHandle {
    pub(crate) const fn new(tcb: Arc<ThreadControlBlock>) -> Self {
        Self { tcb }
    }

    /// Target's registry id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.tcb.id()
    }

    /// Target's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.tcb.name()
    }

    /// Target's current phase.
    #[must_use]
    pub fn phase(&self) -> ThreadPhase {
        self.tcb.phase()
    }

    /// Target's fiber state.
    #[must_use]
    pub fn fiber_state(&self) -> FiberTransition {
        self.tcb.fiber.get()
    }

    /// Whether the target has exited.
    #[must_use]
    pub fn is_zombie(&self) -> bool {
        self.tcb.zombie.load(Ordering::Acquire)
    }

    /// Whether the target marked itself as sleeping.
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.tcb.sleeping.load(Ordering::Acquire)
    }

    /// Object the target is waiting on, if it announced one.
    #[must_use]
    pub fn waiting_object(&self) -> Option<Value> {
        self.tcb.rendezvous.lock().object
    }

    /// Ask the target to raise `exception` at its next interrupt check.
    ///
    /// A raise already pending is kept.
    pub fn register_raise(&self, exception: Value) {
        self.tcb.with_interrupts(|flags| {
            if flags.interrupted_exception.is_none() {
                flags.interrupted_exception = Some(exception);
            }
            flags.check_local_interrupts = true;
        });
        self.wakeup();
    }

    /// Ask the target to terminate at its next interrupt check.
    pub fn register_kill(&self) {
        self.tcb.with_interrupts(|flags| {
            flags.interrupt_by_kill = true;
            flags.check_local_interrupts = true;
        });
        self.wakeup();
    }

    /// Tell the target a signal is waiting for it.
    pub fn interrupt_with_signal(&self) {
        self.tcb.with_interrupts(|flags| {
            flags.interrupt_with_signal = true;
            flags.check_local_interrupts = true;
        });
        self.wakeup();
    }

    /// Switch debugger single-stepping on or off.
    pub fn set_thread_step(&self, step: bool) {
        self.tcb.with_interrupts(|flags| {
            flags.thread_step = step;
            flags.check_local_interrupts |= step;
        });
    }

    /// Wake the target from whatever it is waiting on.
    pub fn wakeup(&self) {
        let waiter = match &self.tcb.rendezvous.lock().waiter {
            Waiter::None => None,
            Waiter::Channel(chan) => Some(Waiter::Channel(Arc::clone(chan))),
            Waiter::Custom(f) => Some(Waiter::Custom(Arc::clone(f))),
        };
        match waiter {
            Some(Waiter::Channel(chan)) => chan.notify_waiters(),
            Some(Waiter::Custom(f)) => f(),
            _ => {}
        }
        self.tcb.park.notify();
    }

    /// Release a `park` on the target, leaving a permit if it is not parked yet.
    pub fn unpark(&self) {
        self.tcb.park.unpark();
    }

    /// Resume a suspended fiber.
    ///
    /// # Errors
    ///
    /// Fails unless the fiber is `Suspended`.
    pub fn fiber_resume(&self) -> Result<(), ProtocolViolation> {
        let _guard = self.tcb.fiber_wait.lock();
        self.tcb.fiber.transition(FiberTransition::Resuming)?;
        self.tcb.fiber_cond.notify_all();
        Ok(())
    }

    /// Cancel a running or suspended fiber.
    ///
    /// # Errors
    ///
    /// Fails unless the fiber is `Running` or `Suspended`.
    pub fn fiber_cancel(&self) -> Result<(), ProtocolViolation> {
        let _guard = self.tcb.fiber_wait.lock();
        self.tcb.fiber.transition(FiberTransition::Canceled)?;
        self.tcb.fiber_cond.notify_all();
        Ok(())
    }

    /// Snapshot of the target's counters.
    #[must_use]
    pub fn metrics(&self) -> ContextMetrics {
        self.tcb.metrics()
    }

    pub(crate) const fn tcb(&self) -> &Arc<ThreadControlBlock> {
        &self.tcb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmError;
    use std::time::Duration;

    fn handle() -> ContextHandle {
        ContextHandle::new(Arc::new(ThreadControlBlock::new(
            7,
            "worker".into(),
            Duration::from_micros(50),
        )))
    }

    #[test]
    fn test_new_block_starts_unmanaged_and_running() {
        let h = handle();
        assert_eq!(h.id(), 7);
        assert_eq!(h.name(), "worker");
        assert_eq!(h.phase(), ThreadPhase::Unmanaged);
        assert_eq!(h.fiber_state(), FiberTransition::Running);
        assert!(!h.is_zombie());
    }

    #[test]
    fn test_register_kill_publishes_hint() {
        let h = handle();
        assert!(!h.tcb().interrupt_pending());
        h.register_kill();
        assert!(h.tcb().interrupt_pending());
        let pending = h.tcb().with_interrupts(InterruptFlags::take_pending);
        assert_eq!(pending, Some(VmError::Killed));
        assert!(!h.tcb().interrupt_pending());
    }

    #[test]
    fn test_second_raise_does_not_replace_first() {
        let h = handle();
        h.register_raise(Value::from_int(1));
        h.register_raise(Value::from_int(2));
        let pending = h.tcb().with_interrupts(InterruptFlags::take_pending);
        assert_eq!(pending, Some(VmError::Raised(Value::from_int(1))));
    }

    #[test]
    fn test_resume_requires_suspended() {
        let h = handle();
        assert!(h.fiber_resume().is_err());
        h.fiber_cancel().unwrap();
        assert_eq!(h.fiber_state(), FiberTransition::Canceled);
    }

    #[test]
    fn test_wakeup_runs_custom_waiter() {
        let h = handle();
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = Arc::clone(&hits);
            h.tcb().rendezvous.lock().waiter = Waiter::Custom(Arc::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }
        h.wakeup();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
