//! Per-thread execution state.
//!
//! An [`ExecutionContext`] belongs to exactly one OS thread. It is created on
//! that thread, registers itself with the [`ThreadNexus`] and unregisters on
//! drop. Everything another thread may need lives in the shared
//! [`ThreadControlBlock`] and is reached through a [`ContextHandle`].
//!
//! # Checkpoints
//!
//! The interpreter calls [`ExecutionContext::checkpoint`] at allocation
//! sites, call boundaries and loop back-edges. A checkpoint parks the thread
//! while a stop is raised, takes a profiling sample now and then, and turns
//! deferred conditions (a failed allocation, a raise or kill from another
//! thread) into an error.

mod control;
mod fiber;
mod frame;
mod interrupt;
mod sampler;

pub use control::{ContextHandle, ThreadControlBlock, ThreadId, ThreadPhase};
pub use fiber::{FiberFlag, FiberTransition, FiberWake};
pub use frame::{CallFrame, FrameStack};
pub use interrupt::{InterruptFlags, ThreadState};
pub use sampler::{draw_interval, Profile, Sampler, MAX_INTERVAL, MAX_SHIFT};

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use control::Waiter;

use crate::error::{ProtocolViolation, Result, VmError};
use crate::memory::{AllocationStats, ThreadLocalAllocator};
use crate::metrics::ContextMetrics;
use crate::nexus::ThreadNexus;
use crate::stack::{native_stack, stack_address, StackLimits};
use crate::value::{ObjectRef, ObjectType, Value};
use crate::wait::{self, Channel};

/// The owning thread's view of its execution state.
///
/// Not `Send`: the stack bounds are those of the creating thread.
pub struct ExecutionContext {
    tcb: Arc<ThreadControlBlock>,
    nexus: Arc<ThreadNexus>,
    limits: StackLimits,
    sampler: Sampler,
    allocator: ThreadLocalAllocator,
    state: ThreadState,
    _not_send: PhantomData<*const ()>,
}

impl ExecutionContext {
    /// Register a context for the current thread and enter the Managed phase.
    ///
    /// The native stack size is read from the platform when possible and
    /// falls back to the configured default.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::StackTooSmall`] if the stack is not larger than
    /// the configured cushion.
    pub fn new(nexus: &Arc<ThreadNexus>, name: &str) -> Result<Self> {
        let config = *nexus.config();
        let total = native_stack().map_or(config.stack_size, |s| s.size());
        let limits = StackLimits::new(stack_address(), total, config.stack_cushion)?;

        let tcb = nexus.register(name);
        let ctx = Self {
            tcb,
            nexus: Arc::clone(nexus),
            limits,
            sampler: Sampler::new(),
            allocator: ThreadLocalAllocator::new(Arc::clone(nexus.chunk_space())),
            state: ThreadState::default(),
            _not_send: PhantomData,
        };
        ctx.nexus.enter_managed(&ctx.tcb);
        Ok(ctx)
    }

    /// Registry id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.tcb.id()
    }

    /// Name given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        self.tcb.name()
    }

    /// A handle other threads can use to reach this context.
    #[must_use]
    pub fn handle(&self) -> ContextHandle {
        ContextHandle::new(Arc::clone(&self.tcb))
    }

    /// The nexus this context is registered with.
    #[must_use]
    pub const fn nexus(&self) -> &Arc<ThreadNexus> {
        &self.nexus
    }

    pub(crate) const fn tcb(&self) -> &Arc<ThreadControlBlock> {
        &self.tcb
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> ContextMetrics {
        self.tcb.metrics()
    }

    fn require_managed(&self, operation: &'static str) -> Result<(), ProtocolViolation> {
        if self.tcb.phase() == ThreadPhase::Managed {
            Ok(())
        } else {
            Err(ProtocolViolation::NotManaged { operation })
        }
    }

    // ========================================================================
    // Checkpoints and sampling
    // ========================================================================

    /// Cooperative safepoint.
    ///
    /// Parks while a stop is raised, counts towards the next profiling
    /// sample, and delivers any pending unwind.
    ///
    /// # Errors
    ///
    /// - [`ProtocolViolation::NotManaged`] outside the Managed phase.
    /// - The pending unwind: [`VmError::OutOfMemory`], [`VmError::Raised`] or
    ///   [`VmError::Killed`].
    #[inline]
    pub fn checkpoint(&mut self) -> Result<()> {
        self.require_managed("checkpoint")?;
        self.tcb
            .counters
            .checkpoints
            .fetch_add(1, Ordering::Relaxed);
        self.nexus.park_for_stop(&self.tcb);

        let tcb = &self.tcb;
        // SAFETY: the owning thread reads its own frames while Managed.
        if self
            .sampler
            .tick(|| unsafe { tcb.frames() }.top().map(|f| f.method))
        {
            tcb.counters.samples.fetch_add(1, Ordering::Relaxed);
        }

        if self.thread_interrupted_p() {
            if let Some(err) = self.state.take() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// The sampler and the profile it has gathered.
    #[must_use]
    pub const fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    // ========================================================================
    // Call frames
    // ========================================================================

    /// Install `frame` as the current frame.
    ///
    /// # Errors
    ///
    /// - [`VmError::StackOverflow`] if the native stack has no headroom left.
    /// - [`ProtocolViolation::NotManaged`] outside the Managed phase.
    pub fn push_call_frame(&mut self, frame: Box<CallFrame>) -> Result<()> {
        self.require_managed("push_call_frame")?;
        self.check_stack(stack_address())?;
        // SAFETY: owner thread, Managed.
        unsafe { self.tcb.frames_mut() }.push(frame);
        Ok(())
    }

    /// Remove the current frame, restoring its caller, then check for
    /// asynchronous interrupts.
    ///
    /// The frame is removed even when an interrupt is reported.
    ///
    /// # Errors
    ///
    /// - [`ProtocolViolation::EmptyFrameStack`] with no frame to pop.
    /// - The pending unwind if an interrupt was delivered.
    pub fn pop_call_frame(&mut self) -> Result<Box<CallFrame>> {
        self.require_managed("pop_call_frame")?;
        // SAFETY: owner thread, Managed.
        let frame = unsafe { self.tcb.frames_mut() }
            .pop()
            .ok_or(ProtocolViolation::EmptyFrameStack)?;
        if self.thread_interrupted_p() {
            if let Some(err) = self.state.take() {
                return Err(err);
            }
        }
        Ok(frame)
    }

    fn frames(&self) -> Result<&FrameStack, ProtocolViolation> {
        self.require_managed("call_frame")?;
        // SAFETY: owner thread, Managed. A collector only touches these
        // frames while this thread is not Managed, and every phase change
        // takes `&mut self`, so the returned borrow cannot outlive the phase.
        Ok(unsafe { self.tcb.frames() })
    }

    /// The current frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NotManaged`] outside the Managed phase.
    pub fn call_frame(&self) -> Result<Option<&CallFrame>, ProtocolViolation> {
        Ok(self.frames()?.top())
    }

    /// The current frame, mutably.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NotManaged`] outside the Managed phase.
    pub fn call_frame_mut(&mut self) -> Result<Option<&mut CallFrame>, ProtocolViolation> {
        self.require_managed("call_frame_mut")?;
        // SAFETY: as for `frames`, with exclusivity from `&mut self`.
        Ok(unsafe { self.tcb.frames_mut() }.top_mut())
    }

    /// The frame `up` levels below the current one.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NotManaged`] outside the Managed phase.
    pub fn get_call_frame(&self, up: usize) -> Result<Option<&CallFrame>, ProtocolViolation> {
        Ok(self.frames()?.get(up))
    }

    /// Number of frames on the stack.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NotManaged`] outside the Managed phase.
    pub fn call_depth(&self) -> Result<usize, ProtocolViolation> {
        Ok(self.frames()?.depth())
    }

    // ========================================================================
    // Stack bounds
    // ========================================================================

    /// Re-anchor the stack bounds at the current address with `size` bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::StackTooSmall`] if `size` does not exceed the cushion.
    pub fn set_stack_bounds(&mut self, size: usize) -> Result<(), ProtocolViolation> {
        self.limits = StackLimits::new(stack_address(), size, self.limits.cushion())?;
        Ok(())
    }

    /// Check that `size` is usable as a stack size.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::StackTooSmall`] if `size` does not exceed the cushion.
    pub const fn validate_stack_size(&self, size: usize) -> Result<(), ProtocolViolation> {
        if size <= self.limits.cushion() {
            return Err(ProtocolViolation::StackTooSmall {
                size,
                cushion: self.limits.cushion(),
            });
        }
        Ok(())
    }

    /// Current stack bounds.
    #[must_use]
    pub const fn stack_limits(&self) -> StackLimits {
        self.limits
    }

    /// Headroom left at `address`.
    #[must_use]
    pub const fn stack_remaining(&self, address: usize) -> isize {
        self.limits.remaining(address)
    }

    /// Fail if there is no headroom left at `address`.
    ///
    /// # Errors
    ///
    /// [`VmError::StackOverflow`] iff the headroom is not positive.
    pub const fn check_stack(&self, address: usize) -> Result<()> {
        self.limits.check(address)
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Convert a pending raise or kill into this thread's unwind.
    ///
    /// Returns whether an unwind is now pending.
    pub fn thread_interrupted_p(&mut self) -> bool {
        if self.tcb.interrupt_pending() {
            if let Some(err) = self.tcb.with_interrupts(InterruptFlags::take_pending) {
                crate::tracing::internal::log_interrupt_delivered(
                    self.tcb.id(),
                    match err {
                        VmError::Killed => "kill",
                        _ => "raise",
                    },
                );
                self.state.raise(err);
            }
        }
        self.state.is_unwinding()
    }

    /// Take the pending unwind, if any.
    pub fn take_unwind(&mut self) -> Option<VmError> {
        self.state.take()
    }

    /// The pending unwind, if any.
    #[must_use]
    pub const fn pending_unwind(&self) -> Option<&VmError> {
        self.state.pending()
    }

    /// Acknowledge a signal interrupt. Returns whether one was pending.
    pub fn take_signal_interrupt(&mut self) -> bool {
        self.tcb.with_interrupts(InterruptFlags::take_signal)
    }

    /// Whether single-stepping was requested.
    #[must_use]
    pub fn thread_step(&self) -> bool {
        self.tcb.interrupts.lock().thread_step
    }

    // ========================================================================
    // Fibers
    // ========================================================================

    /// Current fiber state.
    #[must_use]
    pub fn fiber_state(&self) -> FiberTransition {
        self.tcb.fiber.get()
    }

    /// Suspend the fiber and block, Unmanaged, until another thread resumes
    /// or cancels it.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::IllegalFiberTransition`] unless the fiber is
    /// `Running`, or [`ProtocolViolation::NotManaged`].
    pub fn fiber_suspend(&mut self) -> Result<FiberWake> {
        self.require_managed("fiber_suspend")?;
        self.tcb.fiber.transition(FiberTransition::Suspending)?;

        self.nexus.leave_managed(&self.tcb);
        let parked = {
            let mut guard = self.tcb.fiber_wait.lock();
            let parked = self.tcb.fiber.transition(FiberTransition::Suspended);
            if parked.is_ok() {
                while self.tcb.fiber.get() == FiberTransition::Suspended {
                    self.tcb.fiber_cond.wait(&mut guard);
                }
            }
            parked
        };
        self.nexus.enter_managed(&self.tcb);
        parked?;

        match self.tcb.fiber.get() {
            FiberTransition::Resuming => {
                self.tcb.fiber.transition(FiberTransition::Running)?;
                Ok(FiberWake::Resumed)
            }
            FiberTransition::Canceled => Ok(FiberWake::Canceled),
            from => Err(ProtocolViolation::IllegalFiberTransition {
                from,
                to: FiberTransition::Running,
            }
            .into()),
        }
    }

    /// Mark a cancelled fiber as finished.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::IllegalFiberTransition`] unless the fiber is `Canceled`.
    pub fn fiber_finish(&mut self) -> Result<(), ProtocolViolation> {
        self.tcb.fiber.transition(FiberTransition::Finished).map(|_| ())
    }

    // ========================================================================
    // Phases
    // ========================================================================

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ThreadPhase {
        self.tcb.phase()
    }

    /// Enter the Managed phase, blocking while another thread's stop is raised.
    pub fn managed_phase(&mut self) {
        self.nexus.enter_managed(&self.tcb);
    }

    /// Enter the Unmanaged phase.
    ///
    /// Until the matching [`ExecutionContext::managed_phase`], frame and
    /// allocation operations fail with [`ProtocolViolation::NotManaged`].
    /// Prefer [`ExecutionContext::unmanaged`].
    pub fn unmanaged_phase(&mut self) {
        self.nexus.leave_managed(&self.tcb);
    }

    /// Run `f` in the Unmanaged phase.
    ///
    /// `f` cannot reach this context, so it cannot touch its frames or
    /// allocate while stops proceed without it.
    pub fn unmanaged<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.nexus.leave_managed(&self.tcb);
        let out = f();
        self.nexus.enter_managed(&self.tcb);
        out
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    fn set_waiter(&self, waiter: Waiter) {
        self.tcb.rendezvous.lock().waiter = waiter;
    }

    /// Forget the channel, custom wakeup and waiting object.
    pub fn clear_waiter(&mut self) {
        let mut rendezvous = self.tcb.rendezvous.lock();
        rendezvous.waiter = Waiter::None;
        rendezvous.object = None;
    }

    /// Announce the object this thread is about to wait on. It is kept alive
    /// as a root until [`ExecutionContext::clear_waiter`].
    pub fn set_waiting_object(&mut self, object: Value) {
        self.tcb.rendezvous.lock().object = Some(object);
    }

    /// Object announced by [`ExecutionContext::set_waiting_object`].
    #[must_use]
    pub fn waiting_object(&self) -> Option<Value> {
        self.tcb.rendezvous.lock().object
    }

    /// Deliver a pending raise or kill after a wait returned early.
    fn interrupted(&mut self) -> Option<VmError> {
        self.thread_interrupted_p();
        self.state.take()
    }

    /// Block, Unmanaged, until a value arrives on `channel`.
    ///
    /// # Errors
    ///
    /// The pending unwind if a raise or kill arrives first, or
    /// [`ProtocolViolation::NotManaged`].
    pub fn wait_on_channel(&mut self, channel: &Arc<Channel>) -> Result<Value> {
        self.require_managed("wait_on_channel")?;
        self.set_waiter(Waiter::Channel(Arc::clone(channel)));
        let tcb = Arc::clone(&self.tcb);
        let result = loop {
            let got = self.unmanaged(|| channel.receive(|| tcb.wants_wakeup()));
            if let Some(value) = got {
                break Ok(value);
            }
            if let Some(err) = self.interrupted() {
                break Err(err);
            }
        };
        self.set_waiter(Waiter::None);
        result
    }

    /// Run `wait`, Unmanaged, with `wakeup` registered as the way other
    /// threads interrupt it.
    ///
    /// # Errors
    ///
    /// The pending unwind if a raise or kill arrived during the wait, or
    /// [`ProtocolViolation::NotManaged`].
    pub fn wait_on_custom_function<R>(
        &mut self,
        wakeup: impl Fn() + Send + Sync + 'static,
        wait: impl FnOnce() -> R,
    ) -> Result<R> {
        self.require_managed("wait_on_custom_function")?;
        self.set_waiter(Waiter::Custom(Arc::new(wakeup)));
        // A raise or kill registered before the waiter was installed found
        // nothing to call, so `wait` would never be woken.
        if self.tcb.wants_wakeup() {
            if let Some(err) = self.interrupted() {
                self.set_waiter(Waiter::None);
                return Err(err);
            }
        }
        let out = self.unmanaged(wait);
        self.set_waiter(Waiter::None);
        match self.interrupted() {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    /// Block, Unmanaged, until unparked through a [`ContextHandle`].
    ///
    /// # Errors
    ///
    /// The pending unwind if a raise or kill arrives first, or
    /// [`ProtocolViolation::NotManaged`].
    pub fn park(&mut self) -> Result<()> {
        self.require_managed("park")?;
        let tcb = Arc::clone(&self.tcb);
        loop {
            if self.unmanaged(|| tcb.park.park(|| tcb.wants_wakeup())) {
                return Ok(());
            }
            if let Some(err) = self.interrupted() {
                return Err(err);
            }
        }
    }

    /// Like [`ExecutionContext::park`] but gives up after `timeout`.
    ///
    /// Returns `true` if unparked, `false` on timeout.
    ///
    /// # Errors
    ///
    /// As for [`ExecutionContext::park`].
    pub fn park_timed(&mut self, timeout: Duration) -> Result<bool> {
        self.require_managed("park_timed")?;
        let tcb = Arc::clone(&self.tcb);
        let unparked = self.unmanaged(|| tcb.park.park_timeout(timeout, || tcb.wants_wakeup()));
        if unparked {
            return Ok(true);
        }
        self.interrupted().map_or(Ok(false), Err)
    }

    /// Mark this thread as sleeping, for introspection.
    pub fn set_sleeping(&self) {
        self.tcb.set_sleeping(true);
    }

    /// Clear the sleeping mark.
    pub fn clear_sleeping(&self) {
        self.tcb.set_sleeping(false);
    }

    /// Poll `done`, Unmanaged, within the configured retry budget.
    ///
    /// # Errors
    ///
    /// [`VmError::WaitTimeout`] naming `what` once the budget is spent.
    pub fn limited_wait_for(&mut self, what: &'static str, done: impl FnMut() -> bool) -> Result<()> {
        let limit = self.nexus.config().wait_limit;
        let interval = self.nexus.config().wait_interval;
        if self.unmanaged(|| wait::limited_wait_for(limit, interval, done)) {
            return Ok(());
        }
        crate::tracing::internal::log_wait_timeout(what, limit);
        Err(VmError::WaitTimeout(what))
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a `bytes`-byte object of type `ty`.
    ///
    /// On failure returns `None` and records [`VmError::OutOfMemory`], which
    /// the next checkpoint reports. Outside the Managed phase it returns
    /// `None` and records [`ProtocolViolation::NotManaged`] the same way.
    /// Allocation pressure asks the nexus for a collection; it never
    /// collects here.
    pub fn allocate(&mut self, bytes: usize, ty: ObjectType) -> Option<ObjectRef> {
        if let Err(violation) = self.require_managed("allocate") {
            self.state.raise(violation.into());
            return None;
        }
        let obj = self.allocator.allocate(bytes, ty);
        if self.allocator.take_collect_hint() {
            self.nexus.gc_soon();
        }
        if obj.is_none() {
            crate::tracing::internal::log_out_of_memory(self.tcb.id(), bytes);
            self.state.raise(VmError::OutOfMemory { requested: bytes });
        }
        obj
    }

    /// Allocator counters.
    #[must_use]
    pub const fn allocation_stats(&self) -> AllocationStats {
        self.allocator.stats()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.allocator.flush();
        self.nexus.unregister(&self.tcb);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tcb", &self.tcb)
            .field("limits", &self.limits)
            .field("unwinding", &self.state.is_unwinding())
            .finish_non_exhaustive()
    }
}
