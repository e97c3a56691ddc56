//! Collection orchestrator.
//!
//! The [`Collector`] does not decide what is garbage. It stops the world,
//! brackets every registered [`Heap`] plus the stack roots of the stopped
//! threads, and feeds each root to an external [`Tracer`]. Before the world
//! resumes it sweeps the retired chunks the tracer reports dead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::chunk::Chunk;
use super::heap::{CollectReason, GcData, Heap};
use super::roots::StackRoots;
use crate::context::ExecutionContext;
use crate::error::{ProtocolViolation, Result};
use crate::metrics::CollectionMetrics;
use crate::value::ObjectRef;

/// The collection algorithm, as seen by the orchestrator.
pub trait Tracer {
    /// Process one root and return where it now lives.
    fn trace(&mut self, obj: ObjectRef) -> ObjectRef;

    /// Whether `chunk` still holds objects reachable after tracing.
    ///
    /// Asked once per retired chunk after every heap finished. Chunks
    /// reported dead are freed before the world resumes, and any
    /// [`ObjectRef`] into them must not be dereferenced again. The default
    /// keeps every chunk.
    fn chunk_live(&mut self, chunk: &Chunk) -> bool {
        let _ = chunk;
        true
    }
}

impl<F: FnMut(ObjectRef) -> ObjectRef> Tracer for F {
    fn trace(&mut self, obj: ObjectRef) -> ObjectRef {
        self(obj)
    }
}

/// Shared heap as stored by the collector.
pub type SharedHeap = Arc<dyn Heap + Send + Sync>;

/// Runs collection cycles over a fixed set of shared heaps.
pub struct Collector {
    heaps: Vec<SharedHeap>,
    cycles: AtomicU64,
    last: Mutex<Option<CollectionMetrics>>,
}

impl Collector {
    /// A collector over `heaps`. Stack roots are added per cycle.
    #[must_use]
    pub fn new(heaps: Vec<SharedHeap>) -> Self {
        Self {
            heaps,
            cycles: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    /// Add a heap for future cycles.
    pub fn register(&mut self, heap: SharedHeap) {
        self.heaps.push(heap);
    }

    /// Registered heaps, stack roots excluded.
    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Cycles completed or attempted.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Metrics of the last successful cycle.
    #[must_use]
    pub fn last_metrics(&self) -> Option<CollectionMetrics> {
        *self.last.lock()
    }

    /// Run one cycle with `ctx` as the stopping thread.
    ///
    /// # Errors
    ///
    /// Anything [`ThreadNexus::stop_the_world`](crate::ThreadNexus::stop_the_world)
    /// returns, or the first [`ProtocolViolation`] a heap reports. Heaps
    /// already opened are closed again before the error is returned.
    pub fn collect(
        &self,
        ctx: &mut ExecutionContext,
        tracer: &mut dyn Tracer,
        reason: CollectReason,
    ) -> Result<CollectionMetrics> {
        let started = Instant::now();
        let nexus = Arc::clone(ctx.nexus());
        let mut world = nexus.stop_the_world(ctx)?;
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let data = GcData { cycle, reason };
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_collection(cycle, reason.as_str());

        let mut metrics = CollectionMetrics {
            cycle,
            stop_latency: world.latency(),
            ..CollectionMetrics::default()
        };
        {
            let stack = StackRoots::new(&mut world);
            let mut heaps: Vec<&dyn Heap> = self.heaps.iter().map(|h| &**h as &dyn Heap).collect();
            heaps.push(&stack);
            metrics.heaps = heaps.len();
            run_cycle(&heaps, &data, tracer, &mut metrics)?;
            metrics.threads_scanned = stack.threads_scanned();
        }
        metrics.bytes_released = nexus
            .chunk_space()
            .sweep(&world, &mut |chunk| tracer.chunk_live(chunk));
        drop(world);

        nexus.take_collect_request();
        metrics.duration = started.elapsed();
        *self.last.lock() = Some(metrics);
        Ok(metrics)
    }

    /// Run a cycle only if an allocator asked for one.
    ///
    /// # Errors
    ///
    /// As for [`Collector::collect`].
    pub fn collect_if_requested(
        &self,
        ctx: &mut ExecutionContext,
        tracer: &mut dyn Tracer,
    ) -> Result<Option<CollectionMetrics>> {
        if !ctx.nexus().collect_requested() {
            return Ok(None);
        }
        self.collect(ctx, tracer, CollectReason::Requested).map(Some)
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("heaps", &self.heaps.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("cycles", &self.cycles())
            .finish()
    }
}

fn run_cycle(
    heaps: &[&dyn Heap],
    data: &GcData,
    tracer: &mut dyn Tracer,
    metrics: &mut CollectionMetrics,
) -> std::result::Result<(), ProtocolViolation> {
    for (opened, heap) in heaps.iter().enumerate() {
        if let Err(err) = heap.collect_start(data) {
            abort(&heaps[..opened], data);
            return Err(err);
        }
    }

    {
        let mut visit = |obj: ObjectRef| {
            let moved = tracer.trace(obj);
            metrics.roots_visited += 1;
            if moved != obj {
                metrics.roots_moved += 1;
            }
            moved
        };
        for heap in heaps {
            if let Err(err) = heap.collect_roots(&mut visit) {
                abort(heaps, data);
                return Err(err);
            }
        }
    }

    let mut first = None;
    for heap in heaps {
        if let Err(err) = heap.collect_finish(data) {
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

fn abort(heaps: &[&dyn Heap], data: &GcData) {
    for heap in heaps {
        // Already failing; a second violation adds nothing.
        let _ = heap.collect_finish(data);
    }
}
