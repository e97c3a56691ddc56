//! Thread registry and stop-the-world coordination.
//!
//! # Handshake
//!
//! Entering the Managed phase and raising a stop form a Dekker pair:
//!
//! - a thread stores `phase = Managed` and then loads `stop`;
//! - the stopper stores `stop = true` and then loads every `phase`.
//!
//! Both sides use `SeqCst`, so at least one of them sees the other's store.
//! Either the thread backs off to Unmanaged until the stop is released, or
//! the stopper waits for that thread to park at its next checkpoint.
//!
//! # Lock ordering
//!
//! `rendezvous` is taken before `threads`. Nothing takes `rendezvous` while
//! holding `threads`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

use crate::config::RuntimeConfig;
use crate::context::{
    ContextHandle, ExecutionContext, FrameStack, ThreadControlBlock, ThreadId, ThreadPhase,
};
use crate::error::{ProtocolViolation, Result, VmError};
use crate::memory::ChunkSpace;
use crate::metrics::{NexusCounters, NexusMetrics};
use crate::value::ObjectRef;

/// How long the stopper sleeps between scans of the registry.
const ARRIVAL_POLL: Duration = Duration::from_millis(1);

/// No thread owns the stop.
const NO_OWNER: ThreadId = 0;

/// The process-wide registry of execution contexts.
///
/// Created once per runtime and shared by `Arc` with every context.
#[derive(Debug)]
pub struct ThreadNexus {
    config: RuntimeConfig,
    space: Arc<ChunkSpace>,
    threads: Mutex<Vec<Arc<ThreadControlBlock>>>,
    next_id: AtomicU32,
    stop: CachePadded<AtomicBool>,
    owner: AtomicU32,
    cycle: AtomicU64,
    rendezvous: Mutex<()>,
    released: Condvar,
    arrived: Condvar,
    collect_requested: AtomicBool,
    collect_wait: Mutex<()>,
    collect_cond: Condvar,
    counters: NexusCounters,
}

impl ThreadNexus {
    /// Create a nexus and the chunk space its contexts allocate from.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            space: Arc::new(ChunkSpace::new(config)),
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            stop: CachePadded::new(AtomicBool::new(false)),
            owner: AtomicU32::new(NO_OWNER),
            cycle: AtomicU64::new(0),
            rendezvous: Mutex::new(()),
            released: Condvar::new(),
            arrived: Condvar::new(),
            collect_requested: AtomicBool::new(false),
            collect_wait: Mutex::new(()),
            collect_cond: Condvar::new(),
            counters: NexusCounters::default(),
        })
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The chunk space shared by every allocator.
    #[must_use]
    pub const fn chunk_space(&self) -> &Arc<ChunkSpace> {
        &self.space
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Add a new control block. It starts Unmanaged.
    pub(crate) fn register(&self, name: &str) -> Arc<ThreadControlBlock> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tcb = Arc::new(ThreadControlBlock::new(
            id,
            name.to_owned(),
            self.config.spin_hold_warning,
        ));
        self.threads.lock().push(Arc::clone(&tcb));
        crate::tracing::internal::log_thread_registered(id, name);
        tcb
    }

    /// Remove a control block from the registry and mark it a zombie.
    pub(crate) fn unregister(&self, tcb: &ThreadControlBlock) {
        self.threads.lock().retain(|t| t.id() != tcb.id());
        tcb.zombie.store(true, Ordering::Release);
        self.leave_managed(tcb);
        crate::tracing::internal::log_thread_unregistered(tcb.id());
    }

    /// Handles to every registered context.
    #[must_use]
    pub fn contexts(&self) -> Vec<ContextHandle> {
        self.threads
            .lock()
            .iter()
            .map(|tcb| ContextHandle::new(Arc::clone(tcb)))
            .collect()
    }

    /// Handle to the context with `id`, if it is still registered.
    #[must_use]
    pub fn find(&self, id: ThreadId) -> Option<ContextHandle> {
        self.threads
            .lock()
            .iter()
            .find(|tcb| tcb.id() == id)
            .map(|tcb| ContextHandle::new(Arc::clone(tcb)))
    }

    /// Number of registered contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether no context is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    // ========================================================================
    // Phases
    // ========================================================================

    /// Move `ctx` into the Managed phase, first waiting out any stop that
    /// another thread owns.
    ///
    /// Takes the context exclusively so no frame borrow survives the switch.
    pub fn managed_phase(&self, ctx: &mut ExecutionContext) {
        self.enter_managed(ctx.tcb());
    }

    /// Move `ctx` into the Unmanaged phase. It will no longer hold up stops.
    pub fn unmanaged_phase(&self, ctx: &mut ExecutionContext) {
        self.leave_managed(ctx.tcb());
    }

    pub(crate) fn enter_managed(&self, tcb: &ThreadControlBlock) {
        loop {
            tcb.set_phase(ThreadPhase::Managed);
            if !self.stop.load(Ordering::SeqCst) || self.owner.load(Ordering::Acquire) == tcb.id()
            {
                return;
            }
            let mut guard = self.rendezvous.lock();
            tcb.set_phase(ThreadPhase::Unmanaged);
            self.arrived.notify_all();
            while self.stop.load(Ordering::SeqCst) {
                self.released.wait(&mut guard);
            }
        }
    }

    pub(crate) fn leave_managed(&self, tcb: &ThreadControlBlock) {
        tcb.set_phase(ThreadPhase::Unmanaged);
        if self.stop.load(Ordering::SeqCst) {
            let _guard = self.rendezvous.lock();
            self.arrived.notify_all();
        }
    }

    // ========================================================================
    // Stop-the-world
    // ========================================================================

    /// Whether a stop is currently raised.
    #[inline]
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Park `ctx` until the current stop, if any, is released.
    ///
    /// Returns whether the caller had to wait. The stop owner never waits
    /// for its own stop.
    pub fn check_stop(&self, ctx: &ExecutionContext) -> bool {
        self.park_for_stop(ctx.tcb())
    }

    #[inline]
    pub(crate) fn park_for_stop(&self, tcb: &ThreadControlBlock) -> bool {
        // A late observation only delays the park to the next checkpoint; the
        // stopper keeps waiting while this thread is Managed.
        if !self.stop.load(Ordering::Acquire) {
            return false;
        }
        self.park_slow(tcb)
    }

    /// Park once for every stop cycle that is raised while this thread is
    /// Managed, counting each one.
    #[cold]
    fn park_slow(&self, tcb: &ThreadControlBlock) -> bool {
        let mut parked = false;
        loop {
            if !self.stop.load(Ordering::SeqCst) || self.owner.load(Ordering::Acquire) == tcb.id()
            {
                return parked;
            }
            {
                let mut guard = self.rendezvous.lock();
                if self.stop.load(Ordering::SeqCst) {
                    let cycle = self.cycle.load(Ordering::Acquire);
                    tcb.set_phase(ThreadPhase::Parked);
                    self.arrived.notify_all();
                    // A stop raised again before this thread woke is a new
                    // cycle and is parked for separately.
                    while self.stop.load(Ordering::SeqCst)
                        && self.cycle.load(Ordering::Acquire) == cycle
                    {
                        self.released.wait(&mut guard);
                    }
                    tcb.counters.stops.fetch_add(1, Ordering::Relaxed);
                    parked = true;
                }
            }
            tcb.set_phase(ThreadPhase::Managed);
        }
    }

    /// Stop every other Managed context and return a guard that releases
    /// them on drop.
    ///
    /// While waiting for another thread's stop to finish, the caller keeps
    /// servicing that stop, so two would-be stoppers never deadlock.
    ///
    /// # Errors
    ///
    /// - [`ProtocolViolation::NotManaged`] if `ctx` is not Managed.
    /// - [`ProtocolViolation::StopReentered`] if `ctx` already owns a stop.
    pub fn stop_the_world<'a>(&'a self, ctx: &'a mut ExecutionContext) -> Result<StoppedWorld<'a>> {
        self.stop_within(ctx, None)
    }

    /// Like [`ThreadNexus::stop_the_world`], but gives up after the
    /// configured wait budget.
    ///
    /// # Errors
    ///
    /// As for [`ThreadNexus::stop_the_world`], plus [`VmError::WaitTimeout`]
    /// when ownership or the rendezvous was not reached in time.
    pub fn try_stop_the_world<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
    ) -> Result<StoppedWorld<'a>> {
        let budget = self.config.wait_interval * self.config.wait_limit;
        self.stop_within(ctx, Some(Instant::now() + budget))
    }

    fn stop_within<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<StoppedWorld<'a>> {
        let tcb = Arc::clone(ctx.tcb());
        if tcb.phase() != ThreadPhase::Managed {
            return Err(ProtocolViolation::NotManaged {
                operation: "stop_the_world",
            }
            .into());
        }
        self.acquire_ownership(&tcb, deadline)?;

        let started = Instant::now();
        let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
        self.stop.store(true, Ordering::SeqCst);
        #[cfg(feature = "tracing")]
        let span = crate::tracing::internal::trace_stop_cycle(cycle, tcb.id());

        if !self.wait_for_arrivals(tcb.id(), deadline) {
            self.release();
            crate::tracing::internal::log_wait_timeout("safepoint rendezvous", self.config.wait_limit);
            return Err(VmError::WaitTimeout("safepoint rendezvous"));
        }

        let threads = self.threads.lock().clone();
        let latency = started.elapsed();
        crate::tracing::internal::log_world_stopped(threads.len(), latency);
        Ok(StoppedWorld {
            nexus: self,
            owner: ctx,
            threads,
            cycle,
            latency,
            stopped_at: Instant::now(),
            #[cfg(feature = "tracing")]
            _span: span,
        })
    }

    fn acquire_ownership(&self, tcb: &ThreadControlBlock, deadline: Option<Instant>) -> Result<()> {
        let backoff = Backoff::new();
        loop {
            match self.owner.compare_exchange(
                NO_OWNER,
                tcb.id(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(current) if current == tcb.id() => {
                    return Err(ProtocolViolation::StopReentered.into());
                }
                Err(_) => {
                    self.park_for_stop(tcb);
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        crate::tracing::internal::log_wait_timeout(
                            "stop ownership",
                            self.config.wait_limit,
                        );
                        return Err(VmError::WaitTimeout("stop ownership"));
                    }
                    backoff.snooze();
                }
            }
        }
    }

    fn wait_for_arrivals(&self, owner: ThreadId, deadline: Option<Instant>) -> bool {
        let mut guard = self.rendezvous.lock();
        loop {
            let pending = self
                .threads
                .lock()
                .iter()
                .filter(|t| t.id() != owner && t.phase() == ThreadPhase::Managed)
                .count();
            if pending == 0 {
                return true;
            }
            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    ARRIVAL_POLL.min(d - now)
                }
                None => ARRIVAL_POLL,
            };
            self.arrived.wait_for(&mut guard, slice);
        }
    }

    /// Lower the stop and wake every parked thread, then give up ownership.
    fn release(&self) {
        {
            let _guard = self.rendezvous.lock();
            self.stop.store(false, Ordering::SeqCst);
            self.released.notify_all();
        }
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    // ========================================================================
    // Collection requests
    // ========================================================================

    /// Ask for a collection at the next convenient safepoint.
    ///
    /// Wakes a [`CollectorWorker`](crate::memory::CollectorWorker) blocked
    /// in [`ThreadNexus::wait_for_collect_request`]. The worker stops the
    /// world, and every Managed thread parks for it at its next checkpoint.
    pub fn gc_soon(&self) {
        if !self.collect_requested.swap(true, Ordering::AcqRel) {
            self.counters.record_collect_request();
            crate::tracing::internal::log_collect_requested(self.space.allocated_since_collect());
            self.wake_collect_waiters();
        }
    }

    /// Block until a collection is requested or `timeout` passes.
    ///
    /// Returns whether a request is pending. Call it Unmanaged: a blocked
    /// Managed thread would hold up every stop.
    pub fn wait_for_collect_request(&self, timeout: Duration) -> bool {
        let mut guard = self.collect_wait.lock();
        if !self.collect_requested() {
            let _ = self.collect_cond.wait_for(&mut guard, timeout);
        }
        self.collect_requested()
    }

    /// Wake every thread in [`ThreadNexus::wait_for_collect_request`].
    pub(crate) fn wake_collect_waiters(&self) {
        let _guard = self.collect_wait.lock();
        self.collect_cond.notify_all();
    }

    /// Whether a collection has been requested.
    #[must_use]
    pub fn collect_requested(&self) -> bool {
        self.collect_requested.load(Ordering::Acquire)
    }

    /// Consume a pending collection request.
    pub fn take_collect_request(&self) -> bool {
        self.collect_requested.swap(false, Ordering::AcqRel)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> NexusMetrics {
        self.counters.snapshot(self.len())
    }
}

/// Proof that every other Managed context is parked.
///
/// Holds the owner's context exclusively, so the owner cannot touch its own
/// frames while the guard reads or rewrites them. Dropping the guard releases
/// the stop.
#[must_use = "the world resumes as soon as the guard is dropped"]
pub struct StoppedWorld<'a> {
    nexus: &'a ThreadNexus,
    owner: &'a mut ExecutionContext,
    threads: Vec<Arc<ThreadControlBlock>>,
    cycle: u64,
    latency: Duration,
    stopped_at: Instant,
    #[cfg(feature = "tracing")]
    _span: tracing::span::EnteredSpan,
}

impl StoppedWorld<'_> {
    /// Stop cycle number.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Time it took every thread to park.
    #[must_use]
    pub const fn latency(&self) -> Duration {
        self.latency
    }

    /// The nexus that was stopped.
    #[must_use]
    pub const fn nexus(&self) -> &ThreadNexus {
        self.nexus
    }

    /// Id of the stopping context.
    #[must_use]
    pub fn owner_id(&self) -> ThreadId {
        self.owner.id()
    }

    /// Contexts registered when the stop completed.
    #[must_use]
    pub fn contexts(&self) -> Vec<ContextHandle> {
        self.threads
            .iter()
            .map(|tcb| ContextHandle::new(Arc::clone(tcb)))
            .collect()
    }

    /// Number of contexts covered by the stop, the owner included.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Read every context's frame stack.
    pub fn for_each_frames(&self, f: &mut dyn FnMut(ThreadId, &FrameStack)) {
        for tcb in &self.threads {
            // SAFETY: every thread other than the owner is Parked or
            // Unmanaged, and the owner is borrowed exclusively by `self`.
            f(tcb.id(), unsafe { tcb.frames() });
        }
    }

    /// Apply `visit` to every root held by the stopped contexts: frame slots
    /// and announced waiting objects. Returns the number of contexts scanned.
    pub fn visit_roots(&mut self, visit: &mut dyn FnMut(ObjectRef) -> ObjectRef) -> usize {
        for tcb in &self.threads {
            // SAFETY: see `for_each_frames`; `&mut self` rules out a
            // concurrent reader through the same guard.
            unsafe { tcb.frames_mut() }.visit_roots(visit);
            let mut rendezvous = tcb.rendezvous.lock();
            if let Some(object) = rendezvous.object {
                rendezvous.object = Some(object.map_object(&mut *visit));
            }
        }
        self.threads.len()
    }
}

impl Drop for StoppedWorld<'_> {
    fn drop(&mut self) {
        let stopped_for = self.stopped_at.elapsed();
        self.nexus.release();
        self.nexus.counters.record_stop(self.latency, stopped_for);
        crate::tracing::internal::log_world_resumed(stopped_for);
    }
}

impl std::fmt::Debug for StoppedWorld<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoppedWorld")
            .field("cycle", &self.cycle)
            .field("owner", &self.owner.id())
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_distinct_ids() {
        let nexus = ThreadNexus::new(RuntimeConfig::default());
        let a = nexus.register("a");
        let b = nexus.register("b");
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), NO_OWNER);
        assert_eq!(nexus.len(), 2);

        nexus.unregister(&a);
        assert_eq!(nexus.len(), 1);
        assert!(nexus.find(a.id()).is_none());
        assert_eq!(nexus.find(b.id()).map(|h| h.id()), Some(b.id()));
    }

    #[test]
    fn test_single_thread_stop_is_immediate() {
        let nexus = ThreadNexus::new(RuntimeConfig::default());
        let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
        {
            let world = nexus.stop_the_world(&mut ctx).unwrap();
            assert_eq!(world.cycle(), 1);
            assert_eq!(world.thread_count(), 1);
            assert!(nexus.is_stop_requested());
        }
        assert!(!nexus.is_stop_requested());
        assert_eq!(nexus.metrics().stop_cycles, 1);
    }

    #[test]
    fn test_owner_does_not_park_for_own_stop() {
        let nexus = ThreadNexus::new(RuntimeConfig::default());
        let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
        let tcb = Arc::clone(ctx.tcb());
        let world = nexus.stop_the_world(&mut ctx).unwrap();
        assert!(!nexus.park_for_stop(&tcb));
        drop(world);
    }

    #[test]
    fn test_stopped_world_reads_every_frame_stack() {
        let nexus = ThreadNexus::new(RuntimeConfig::default());
        let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
        ctx.push_call_frame(crate::context::CallFrame::new(
            crate::value::Value::from_symbol(3),
            crate::value::Value::FALSE,
            0,
        ))
        .unwrap();
        let id = ctx.id();

        let world = nexus.stop_the_world(&mut ctx).unwrap();
        let mut seen = Vec::new();
        world.for_each_frames(&mut |thread, frames| seen.push((thread, frames.depth())));
        assert_eq!(seen, vec![(id, 1)]);
        assert!(!nexus.check_stop(&*world.owner));
    }

    #[test]
    fn test_unmanaged_context_cannot_stop() {
        let nexus = ThreadNexus::new(RuntimeConfig::default());
        let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
        ctx.unmanaged_phase();
        let err = nexus.stop_the_world(&mut ctx).unwrap_err();
        assert_eq!(
            err,
            VmError::Protocol(ProtocolViolation::NotManaged {
                operation: "stop_the_world"
            })
        );
    }

    #[test]
    fn test_gc_soon_counts_once_until_taken() {
        let nexus = ThreadNexus::new(RuntimeConfig::default());
        nexus.gc_soon();
        nexus.gc_soon();
        assert!(nexus.collect_requested());
        assert!(nexus.take_collect_request());
        assert!(!nexus.take_collect_request());
        assert_eq!(nexus.metrics().collect_requests, 1);
    }

    #[test]
    fn test_collect_request_wakes_waiter() {
        let nexus = ThreadNexus::new(RuntimeConfig::default());
        assert!(!nexus.wait_for_collect_request(Duration::from_millis(5)));

        let waiter = {
            let nexus = Arc::clone(&nexus);
            std::thread::spawn(move || nexus.wait_for_collect_request(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(5));
        let started = Instant::now();
        nexus.gc_soon();
        assert!(waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        // Waiting does not consume the request.
        assert!(nexus.collect_requested());
    }
}
