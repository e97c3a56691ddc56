//! Memory regions, allocation and the collection protocol.

mod allocator;
mod barrier;
mod chunk;
mod collector;
mod heap;
mod roots;
mod worker;

pub use allocator::{AllocationStats, ThreadLocalAllocator};
pub use barrier::{write_barrier, ManagedField, RememberedSet};
pub use chunk::{object_footprint, Chunk, ChunkSpace, CHUNK_ALIGN};
pub use collector::{Collector, SharedHeap, Tracer};
pub use heap::{CollectBracket, CollectReason, GcData, Heap};
pub use roots::{GlobalRoots, RootId, StackRoots};
pub use worker::CollectorWorker;
