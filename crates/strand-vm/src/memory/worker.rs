//! Background thread that services collection requests.
//!
//! Allocators only call [`ThreadNexus::gc_soon`]. A [`CollectorWorker`]
//! registers its own execution context, sleeps Unmanaged until a request
//! arrives, and then runs a cycle through its [`Collector`]. Mutators take
//! part by parking at their next checkpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::collector::{Collector, Tracer};
use crate::context::ExecutionContext;
use crate::error::VmError;
use crate::nexus::ThreadNexus;

/// How long the worker sleeps before rechecking its exit flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct WorkerState {
    exit: AtomicBool,
    cycles: AtomicU64,
    failures: AtomicU64,
}

/// A thread that runs a collection whenever one is requested.
///
/// Dropping the worker stops and joins the thread.
#[derive(Debug)]
pub struct CollectorWorker {
    nexus: Arc<ThreadNexus>,
    state: Arc<WorkerState>,
    thread: Option<JoinHandle<()>>,
}

impl CollectorWorker {
    /// Start a worker named `strand.collector` that collects with `tracer`.
    ///
    /// # Errors
    ///
    /// Whatever the OS reports when the thread cannot be spawned.
    pub fn spawn<T>(
        nexus: &Arc<ThreadNexus>,
        collector: Arc<Collector>,
        tracer: T,
    ) -> std::io::Result<Self>
    where
        T: Tracer + Send + 'static,
    {
        let state = Arc::new(WorkerState::default());
        let thread = std::thread::Builder::new()
            .name("strand.collector".into())
            .spawn({
                let nexus = Arc::clone(nexus);
                let state = Arc::clone(&state);
                move || run(&nexus, &collector, tracer, &state)
            })?;
        Ok(Self {
            nexus: Arc::clone(nexus),
            state,
            thread: Some(thread),
        })
    }

    /// Cycles the worker completed.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.state.cycles.load(Ordering::Acquire)
    }

    /// Cycles that ended in an error.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.state.failures.load(Ordering::Acquire)
    }

    /// Whether the worker thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker and wait for it. Returns `false` if it panicked.
    pub fn shutdown(mut self) -> bool {
        self.stop()
    }

    fn stop(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        self.state.exit.store(true, Ordering::Release);
        self.nexus.wake_collect_waiters();
        thread.join().is_ok()
    }
}

impl Drop for CollectorWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: Tracer>(
    nexus: &Arc<ThreadNexus>,
    collector: &Collector,
    mut tracer: T,
    state: &WorkerState,
) {
    let mut ctx = match ExecutionContext::new(nexus, "collector") {
        Ok(ctx) => ctx,
        Err(err) => {
            crate::tracing::internal::log_collection_failed(&err);
            return;
        }
    };

    while !state.exit.load(Ordering::Acquire) {
        let requested = ctx.unmanaged(|| nexus.wait_for_collect_request(POLL_INTERVAL));
        match ctx.checkpoint() {
            Ok(()) => {}
            Err(VmError::Killed) => break,
            Err(err) => crate::tracing::internal::log_collection_failed(&err),
        }
        if !requested || state.exit.load(Ordering::Acquire) {
            continue;
        }
        match collector.collect_if_requested(&mut ctx, &mut tracer) {
            Ok(Some(_)) => {
                state.cycles.fetch_add(1, Ordering::AcqRel);
            }
            Ok(None) => {}
            Err(err) => {
                // Drop the request; retrying at once would fail the same way.
                nexus.take_collect_request();
                state.failures.fetch_add(1, Ordering::AcqRel);
                crate::tracing::internal::log_collection_failed(&err);
            }
        }
    }
    crate::tracing::internal::log_worker_stopped(state.cycles.load(Ordering::Acquire));
}
