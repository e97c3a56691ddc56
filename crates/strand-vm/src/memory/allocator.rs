//! Thread-local bump allocation.

use std::sync::Arc;

use super::chunk::{object_footprint, Chunk, ChunkSpace};
use crate::value::{ObjectRef, ObjectType};

/// Counters kept by one [`ThreadLocalAllocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Objects allocated.
    pub objects: u64,
    /// Payload bytes allocated.
    pub bytes: u64,
    /// Chunks obtained from the chunk space.
    pub chunks: u64,
    /// Objects that got a dedicated chunk.
    pub large_objects: u64,
    /// Requests that could not be satisfied.
    pub failures: u64,
}

/// Per-thread allocator bumping through a chunk borrowed from a
/// [`ChunkSpace`].
#[derive(Debug)]
pub struct ThreadLocalAllocator {
    space: Arc<ChunkSpace>,
    current: Option<Chunk>,
    stats: AllocationStats,
    wants_collection: bool,
}

impl ThreadLocalAllocator {
    /// An allocator with no chunk yet.
    #[must_use]
    pub const fn new(space: Arc<ChunkSpace>) -> Self {
        Self {
            space,
            current: None,
            stats: AllocationStats {
                objects: 0,
                bytes: 0,
                chunks: 0,
                large_objects: 0,
                failures: 0,
            },
            wants_collection: false,
        }
    }

    /// Allocate a `bytes`-byte object of type `ty`.
    ///
    /// Returns `None` only when the chunk space is exhausted.
    #[inline]
    pub fn allocate(&mut self, bytes: usize, ty: ObjectType) -> Option<ObjectRef> {
        if let Some(obj) = self.current.as_mut().and_then(|c| c.allocate(bytes, ty)) {
            self.record(bytes);
            return Some(obj);
        }
        self.allocate_slow(bytes, ty)
    }

    #[cold]
    fn allocate_slow(&mut self, bytes: usize, ty: ObjectType) -> Option<ObjectRef> {
        let obj = match object_footprint(bytes) {
            Some(footprint) if u32::try_from(bytes).is_ok() => {
                if footprint > self.space.chunk_size() {
                    self.allocate_large(bytes, ty)
                } else {
                    self.refill().and_then(|c| c.allocate(bytes, ty))
                }
            }
            _ => None,
        };
        match obj {
            Some(obj) => {
                self.record(bytes);
                if self.space.over_threshold() {
                    self.wants_collection = true;
                }
            }
            None => {
                self.stats.failures += 1;
                self.wants_collection = true;
            }
        }
        obj
    }

    fn allocate_large(&mut self, bytes: usize, ty: ObjectType) -> Option<ObjectRef> {
        let mut chunk = self.space.request_chunk(bytes)?;
        self.stats.chunks += 1;
        self.stats.large_objects += 1;
        let obj = chunk.allocate(bytes, ty);
        self.space.retire(chunk);
        obj
    }

    fn refill(&mut self) -> Option<&mut Chunk> {
        self.flush();
        let chunk = self.space.request_chunk(0)?;
        self.stats.chunks += 1;
        Some(self.current.insert(chunk))
    }

    const fn record(&mut self, bytes: usize) {
        self.stats.objects += 1;
        self.stats.bytes += bytes as u64;
    }

    /// Retire the current chunk to the chunk space.
    pub fn flush(&mut self) {
        if let Some(chunk) = self.current.take() {
            self.space.retire(chunk);
        }
    }

    /// Whether the allocator wants a collection, clearing the wish.
    pub fn take_collect_hint(&mut self) -> bool {
        std::mem::take(&mut self.wants_collection)
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> AllocationStats {
        self.stats
    }

    /// Bytes left in the current chunk.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.current.as_ref().map_or(0, Chunk::remaining)
    }
}

impl Drop for ThreadLocalAllocator {
    fn drop(&mut self) {
        self.flush();
    }
}
