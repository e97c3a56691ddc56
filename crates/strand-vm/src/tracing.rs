//! Structured logging support.
//!
//! When the `tracing` feature is enabled, this module provides spans and
//! events for stop-the-world cycles, collections and interrupt delivery.
//! Without the feature every helper compiles to nothing, so call sites never
//! need their own `cfg` guards.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::time::Duration;
    use tracing::{span, Level};

    /// Create a span covering one stop-the-world cycle.
    pub fn trace_stop_cycle(cycle: u64, owner: u32) -> span::EnteredSpan {
        span!(Level::DEBUG, "stop_the_world", cycle, owner).entered()
    }

    /// Create a span covering one collection cycle.
    pub fn trace_collection(cycle: u64, reason: &str) -> span::EnteredSpan {
        span!(Level::DEBUG, "collect", cycle, reason).entered()
    }

    /// Log that every managed thread reached its safepoint.
    pub fn log_world_stopped(threads: usize, waited: Duration) {
        tracing::debug!(threads, waited_us = waited.as_micros(), "world_stopped");
    }

    /// Log that a stop was released.
    pub fn log_world_resumed(stopped_for: Duration) {
        tracing::debug!(stopped_us = stopped_for.as_micros(), "world_resumed");
    }

    /// Log context registration.
    pub fn log_thread_registered(thread: u32, name: &str) {
        tracing::trace!(thread, name, "thread_registered");
    }

    /// Log context removal.
    pub fn log_thread_unregistered(thread: u32) {
        tracing::trace!(thread, "thread_unregistered");
    }

    /// Log an asynchronous interrupt being turned into an unwind.
    pub fn log_interrupt_delivered(thread: u32, kind: &str) {
        tracing::debug!(thread, kind, "interrupt_delivered");
    }

    /// Log an allocation failure deferred to the next checkpoint.
    pub fn log_out_of_memory(thread: u32, requested: usize) {
        tracing::warn!(thread, requested, "allocation_failed");
    }

    /// Log a collection request raised by allocation pressure.
    pub fn log_collect_requested(allocated: usize) {
        tracing::debug!(allocated, "collect_requested");
    }

    /// Log a spinlock held longer than its budget.
    pub fn log_slow_spin_hold(held: Duration) {
        tracing::warn!(held_ns = held.as_nanos(), "spinlock_held_too_long");
    }

    /// Log a bounded wait giving up.
    pub fn log_wait_timeout(what: &str, attempts: u32) {
        tracing::warn!(what, attempts, "bounded_wait_timeout");
    }

    /// Log a collection the background worker could not complete.
    pub fn log_collection_failed(error: &dyn std::fmt::Display) {
        tracing::error!(error = %error, "collection_failed");
    }

    /// Log the background collector worker exiting.
    pub fn log_worker_stopped(cycles: u64) {
        tracing::debug!(cycles, "collector_worker_stopped");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use std::time::Duration;

    /// Stub span when tracing is disabled.
    pub fn trace_stop_cycle(_cycle: u64, _owner: u32) {}

    /// Stub span when tracing is disabled.
    pub fn trace_collection(_cycle: u64, _reason: &str) {}

    /// Stub event when tracing is disabled.
    pub fn log_world_stopped(_threads: usize, _waited: Duration) {}

    /// Stub event when tracing is disabled.
    pub fn log_world_resumed(_stopped_for: Duration) {}

    /// Stub event when tracing is disabled.
    pub fn log_thread_registered(_thread: u32, _name: &str) {}

    /// Stub event when tracing is disabled.
    pub fn log_thread_unregistered(_thread: u32) {}

    /// Stub event when tracing is disabled.
    pub fn log_interrupt_delivered(_thread: u32, _kind: &str) {}

    /// Stub event when tracing is disabled.
    pub fn log_out_of_memory(_thread: u32, _requested: usize) {}

    /// Stub event when tracing is disabled.
    pub fn log_collect_requested(_allocated: usize) {}

    /// Stub event when tracing is disabled.
    pub fn log_slow_spin_hold(_held: Duration) {}

    /// Stub event when tracing is disabled.
    pub fn log_wait_timeout(_what: &str, _attempts: u32) {}

    /// Stub event when tracing is disabled.
    pub fn log_collection_failed(_error: &dyn std::fmt::Display) {}

    /// Stub event when tracing is disabled.
    pub fn log_worker_stopped(_cycles: u64) {}
}
