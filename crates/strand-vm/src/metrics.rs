//! Diagnostic counters.
//!
//! Everything here is a read-only snapshot. The live counters are atomics
//! owned by the component they describe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::context::{FiberTransition, ThreadId, ThreadPhase};

/// Snapshot of one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextMetrics {
    /// Registry id.
    pub id: ThreadId,
    /// Phase at the time of the snapshot.
    pub phase: ThreadPhase,
    /// Fiber state at the time of the snapshot.
    pub fiber: FiberTransition,
    /// Checkpoints reached.
    pub checkpoints: u64,
    /// Stops this context parked for.
    pub stops: u64,
    /// Profiling samples taken.
    pub samples: u64,
    /// Whether the context marked itself as sleeping.
    pub sleeping: bool,
}

/// Snapshot of the nexus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NexusMetrics {
    /// Registered contexts.
    pub threads: usize,
    /// Completed stop-the-world cycles.
    pub stop_cycles: u64,
    /// Total time the world spent stopped.
    pub time_stopped: Duration,
    /// Longest single wait for every thread to park.
    pub max_stop_latency: Duration,
    /// Collection requests raised by allocators.
    pub collect_requests: u64,
}

/// Live counters behind [`NexusMetrics`].
#[derive(Debug, Default)]
pub(crate) struct NexusCounters {
    stop_cycles: AtomicU64,
    stopped_ns: AtomicU64,
    max_latency_ns: AtomicU64,
    collect_requests: AtomicU64,
}

impl NexusCounters {
    pub(crate) fn record_stop(&self, latency: Duration, stopped_for: Duration) {
        self.stop_cycles.fetch_add(1, Ordering::Relaxed);
        self.stopped_ns
            .fetch_add(duration_ns(stopped_for), Ordering::Relaxed);
        self.max_latency_ns
            .fetch_max(duration_ns(latency), Ordering::Relaxed);
    }

    pub(crate) fn record_collect_request(&self) {
        self.collect_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, threads: usize) -> NexusMetrics {
        NexusMetrics {
            threads,
            stop_cycles: self.stop_cycles.load(Ordering::Relaxed),
            time_stopped: Duration::from_nanos(self.stopped_ns.load(Ordering::Relaxed)),
            max_stop_latency: Duration::from_nanos(self.max_latency_ns.load(Ordering::Relaxed)),
            collect_requests: self.collect_requests.load(Ordering::Relaxed),
        }
    }
}

/// Statistics from one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionMetrics {
    /// Cycle number.
    pub cycle: u64,
    /// Heaps bracketed, including the stack-root region.
    pub heaps: usize,
    /// Roots passed through the tracer.
    pub roots_visited: usize,
    /// Roots the tracer relocated.
    pub roots_moved: usize,
    /// Contexts whose frames were scanned.
    pub threads_scanned: usize,
    /// Bytes of retired chunks freed by the sweep.
    pub bytes_released: usize,
    /// Time spent waiting for the world to stop.
    pub stop_latency: Duration,
    /// Wall time of the whole cycle.
    pub duration: Duration,
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ns(d: Duration) -> u64 {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}
