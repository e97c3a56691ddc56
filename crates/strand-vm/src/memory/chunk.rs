//! Chunks and the shared chunk space.
//!
//! A [`Chunk`] is one zeroed block of memory that a single thread bump
//! allocates from. The [`ChunkSpace`] hands chunks out and enforces the heap
//! limit. Retired chunks stay allocated until a collection sweeps the ones
//! its tracer no longer needs.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::heap::{CollectBracket, GcData, Heap};
use crate::config::RuntimeConfig;
use crate::error::ProtocolViolation;
use crate::nexus::StoppedWorld;
use crate::value::{ObjectHeader, ObjectRef, ObjectType, HEADER_SIZE, OBJECT_ALIGN};

/// Alignment of every chunk base.
pub const CHUNK_ALIGN: usize = 16;

/// Bytes an object with a `payload`-byte body occupies, header included.
#[must_use]
pub const fn object_footprint(payload: usize) -> Option<usize> {
    match HEADER_SIZE.checked_add(payload) {
        Some(total) => total.checked_next_multiple_of(OBJECT_ALIGN),
        None => None,
    }
}

// ============================================================================
// Chunk
// ============================================================================

/// A bump-allocated block owned by one thread at a time.
pub struct Chunk {
    base: NonNull<u8>,
    layout: Layout,
    cursor: usize,
    objects: usize,
}

// SAFETY: a chunk is exclusively owned; objects inside it are shared only
// through `ObjectRef`, whose mutable state is atomic.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Allocate a zeroed chunk of `size` bytes.
    pub(crate) fn new(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, CHUNK_ALIGN).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self {
            base,
            layout,
            cursor: 0,
            objects: 0,
        })
    }

    /// Total bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes handed out.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.cursor
    }

    /// Bytes left.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    /// Objects allocated here.
    #[must_use]
    pub const fn object_count(&self) -> usize {
        self.objects
    }

    /// Whether `obj` lives in this chunk.
    #[must_use]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        let start = self.base.as_ptr() as usize;
        (start..start + self.cursor).contains(&obj.addr())
    }

    /// Bump allocate a `payload`-byte object of type `ty`.
    #[inline]
    pub(crate) fn allocate(&mut self, payload: usize, ty: ObjectType) -> Option<ObjectRef> {
        let size = u32::try_from(payload).ok()?;
        let footprint = object_footprint(payload)?;
        if footprint > self.remaining() {
            return None;
        }
        // SAFETY: `cursor + footprint <= capacity`, the base is CHUNK_ALIGN
        // aligned and the cursor only moves in OBJECT_ALIGN steps.
        let header = unsafe {
            let ptr = self.base.as_ptr().add(self.cursor).cast::<ObjectHeader>();
            ptr.write(ObjectHeader::new(ty, size));
            NonNull::new_unchecked(ptr)
        };
        self.cursor += footprint;
        self.objects += 1;
        // SAFETY: the header was just initialized. It stays valid until the
        // chunk is swept, which `ObjectRef`'s accessors require callers to
        // rule out.
        Some(unsafe { ObjectRef::from_raw(header) })
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated with exactly `layout`.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .field("used", &self.cursor)
            .finish()
    }
}

// ============================================================================
// ChunkSpace
// ============================================================================

/// The shared provider of chunks for every thread-local allocator.
#[derive(Debug)]
pub struct ChunkSpace {
    chunk_size: usize,
    heap_limit: Option<usize>,
    collect_threshold: usize,
    retired: Mutex<Vec<Chunk>>,
    reserved: AtomicUsize,
    allocated_since_collect: AtomicUsize,
    bracket: CollectBracket,
}

impl ChunkSpace {
    /// An empty space sized by `config`.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.next_multiple_of(CHUNK_ALIGN),
            heap_limit: config.heap_limit,
            collect_threshold: config.collect_threshold,
            retired: Mutex::new(Vec::new()),
            reserved: AtomicUsize::new(0),
            allocated_since_collect: AtomicUsize::new(0),
            bracket: CollectBracket::new(),
        }
    }

    /// Size of a regular chunk.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Hand out a chunk large enough for a `payload`-byte object.
    ///
    /// Returns `None` when the heap limit would be exceeded or the system
    /// allocator fails.
    pub fn request_chunk(&self, payload: usize) -> Option<Chunk> {
        let size = object_footprint(payload)?
            .checked_next_multiple_of(CHUNK_ALIGN)?
            .max(self.chunk_size);
        self.reserve(size)?;
        let Some(chunk) = Chunk::new(size) else {
            self.reserved.fetch_sub(size, Ordering::AcqRel);
            return None;
        };
        self.allocated_since_collect
            .fetch_add(size, Ordering::Relaxed);
        Some(chunk)
    }

    fn reserve(&self, size: usize) -> Option<()> {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(size)?;
            if self.heap_limit.is_some_and(|limit| next > limit) {
                return None;
            }
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Take back a chunk its allocator is done with.
    ///
    /// Empty chunks are freed. Chunks holding objects are kept until
    /// [`ChunkSpace::sweep`] releases them or the space is dropped.
    pub fn retire(&self, chunk: Chunk) {
        if chunk.object_count() == 0 {
            self.reserved.fetch_sub(chunk.capacity(), Ordering::AcqRel);
            drop(chunk);
            return;
        }
        self.retired.lock().push(chunk);
    }

    /// Bytes currently reserved, in live and retired chunks.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Bytes handed out since the last collection finished.
    #[must_use]
    pub fn allocated_since_collect(&self) -> usize {
        self.allocated_since_collect.load(Ordering::Relaxed)
    }

    /// Whether enough has been handed out to warrant a collection.
    #[must_use]
    pub fn over_threshold(&self) -> bool {
        self.allocated_since_collect() >= self.collect_threshold
    }

    /// Number of retired chunks.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Whether `obj` lives in a retired chunk.
    #[must_use]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.retired.lock().iter().any(|c| c.contains(obj))
    }

    /// Free every retired chunk `live` rejects. Returns the bytes released.
    ///
    /// Requires a stopped world: no mutator can be reading an object while
    /// its chunk goes away. Chunks still owned by an allocator are not
    /// retired and never swept.
    pub fn sweep(
        &self,
        _world: &StoppedWorld<'_>,
        live: &mut dyn FnMut(&Chunk) -> bool,
    ) -> usize {
        let dead: Vec<Chunk> = {
            let mut retired = self.retired.lock();
            let (keep, dead): (Vec<Chunk>, Vec<Chunk>) = std::mem::take(&mut *retired)
                .into_iter()
                .partition(|c| live(c));
            *retired = keep;
            dead
        };
        let released = dead.iter().map(Chunk::capacity).sum();
        if released > 0 {
            self.reserved.fetch_sub(released, Ordering::AcqRel);
        }
        released
    }
}

impl Heap for ChunkSpace {
    fn name(&self) -> &'static str {
        "chunk_space"
    }

    fn collect_start(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.start(data)
    }

    fn collect_roots(
        &self,
        _visit: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) -> Result<(), ProtocolViolation> {
        // Chunks hold objects, not roots.
        self.bracket.require_open("collect_roots").map(|_| ())
    }

    fn collect_finish(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.finish(data)?;
        self.allocated_since_collect.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_bump_allocates_aligned_objects() {
        let mut chunk = Chunk::new(256).unwrap();
        let a = chunk.allocate(3, ObjectType(1)).unwrap();
        let b = chunk.allocate(8, ObjectType(2)).unwrap();
        assert_eq!(a.addr() % OBJECT_ALIGN, 0);
        assert_eq!(b.addr() % OBJECT_ALIGN, 0);
        assert_eq!(b.addr() - a.addr(), object_footprint(3).unwrap());
        // SAFETY: `chunk` is alive.
        unsafe {
            assert_eq!(a.size(), 3);
            assert_eq!(b.object_type(), ObjectType(2));
        }
        assert!(chunk.contains(a) && chunk.contains(b));
        assert_eq!(chunk.object_count(), 2);
    }

    #[test]
    fn test_chunk_exhaustion_returns_none() {
        let mut chunk = Chunk::new(64).unwrap();
        let fits = 64 - HEADER_SIZE;
        assert!(chunk.allocate(fits, ObjectType(0)).is_some());
        assert_eq!(chunk.remaining(), 0);
        assert!(chunk.allocate(0, ObjectType(0)).is_none());
    }

    #[test]
    fn test_space_enforces_heap_limit() {
        let config = RuntimeConfig::default()
            .with_chunk_size(1024)
            .with_heap_limit(Some(2048));
        let space = ChunkSpace::new(config);
        let a = space.request_chunk(0).unwrap();
        let _b = space.request_chunk(0).unwrap();
        assert!(space.request_chunk(0).is_none());

        // An empty chunk is returned to the budget.
        space.retire(a);
        assert_eq!(space.reserved(), 1024);
        assert!(space.request_chunk(0).is_some());
    }

    #[test]
    fn test_large_request_gets_dedicated_chunk() {
        let space = ChunkSpace::new(RuntimeConfig::default().with_chunk_size(1024));
        let chunk = space.request_chunk(10_000).unwrap();
        assert!(chunk.capacity() >= object_footprint(10_000).unwrap());
    }

    #[test]
    fn test_finish_resets_allocation_volume() {
        let space = ChunkSpace::new(
            RuntimeConfig::default()
                .with_chunk_size(1024)
                .with_collect_threshold(1024),
        );
        let _chunk = space.request_chunk(0).unwrap();
        assert!(space.over_threshold());

        let data = GcData {
            cycle: 1,
            reason: super::super::heap::CollectReason::Explicit,
        };
        space.collect_start(&data).unwrap();
        space.collect_roots(&mut |o| o).unwrap();
        space.collect_finish(&data).unwrap();
        assert!(!space.over_threshold());
    }

    #[test]
    fn test_sweep_releases_rejected_chunks() {
        use crate::context::ExecutionContext;
        use crate::nexus::ThreadNexus;
        use std::sync::Arc;

        let config = RuntimeConfig::default()
            .with_chunk_size(1024)
            .with_heap_limit(Some(2048));
        let nexus = ThreadNexus::new(config);
        let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
        let space = Arc::clone(nexus.chunk_space());

        let mut keep = space.request_chunk(0).unwrap();
        let mut dead = space.request_chunk(0).unwrap();
        let kept = keep.allocate(8, ObjectType(1)).unwrap();
        dead.allocate(8, ObjectType(1)).unwrap();
        space.retire(keep);
        space.retire(dead);
        assert!(space.request_chunk(0).is_none());

        let world = nexus.stop_the_world(&mut ctx).unwrap();
        let released = space.sweep(&world, &mut |c| c.contains(kept));
        drop(world);

        assert_eq!(released, 1024);
        assert_eq!(space.retired_count(), 1);
        assert!(space.contains(kept));
        assert_eq!(space.reserved(), 1024);
        assert!(space.request_chunk(0).is_some());
    }
}
