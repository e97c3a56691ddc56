//! Execution contexts, safepoints and stop-the-world coordination for a
//! multi-threaded managed runtime.
//!
//! `strand-vm` is the part of a virtual machine that lets many native
//! threads run managed code in parallel while a garbage collector can still
//! pause all of them, inspect their roots and move objects. It does not
//! interpret bytecode and does not pick a collection algorithm; it provides
//! the protocol both sides meet on.
//!
//! # Pieces
//!
//! - [`ThreadNexus`]: the registry every thread joins, and the owner of the
//!   stop-the-world handshake.
//! - [`ExecutionContext`]: one per thread. Call frames, stack bounds,
//!   interrupt delivery, the fiber state machine and the
//!   [`checkpoint`](ExecutionContext::checkpoint) safepoint.
//! - [`memory`]: bump allocation from shared chunks, the write barrier, and
//!   the [`Heap`](memory::Heap) bracket a collection drives every region
//!   through, and a [`CollectorWorker`](memory::CollectorWorker) that runs
//!   cycles when allocation asks for one.
//!
//! # Example
//!
//! ```
//! use strand_vm::memory::{CollectReason, Collector, RememberedSet, SharedHeap};
//! use strand_vm::value::ObjectType;
//! use strand_vm::{CallFrame, ExecutionContext, ObjectRef, RuntimeConfig, ThreadNexus, Value};
//! use std::sync::Arc;
//!
//! let nexus = ThreadNexus::new(RuntimeConfig::default());
//! let mut ctx = ExecutionContext::new(&nexus, "main")?;
//!
//! let obj = ctx.allocate(32, ObjectType(1)).expect("fresh heap");
//! let mut frame = CallFrame::new(Value::from_symbol(1), Value::FALSE, 1);
//! frame.locals[0] = Value::from_object(obj);
//! ctx.push_call_frame(frame)?;
//! ctx.checkpoint()?;
//!
//! let heaps: Vec<SharedHeap> = vec![
//!     Arc::clone(nexus.chunk_space()) as SharedHeap,
//!     Arc::new(RememberedSet::new()),
//! ];
//! let collector = Collector::new(heaps);
//! let stats = collector.collect(&mut ctx, &mut |o: ObjectRef| o, CollectReason::Explicit)?;
//! assert_eq!(stats.roots_visited, 1);
//! # Ok::<(), strand_vm::VmError>(())
//! ```
//!
//! # Features
//!
//! - `tracing` (default): structured spans and events through the
//!   [`tracing`](https://docs.rs/tracing) crate.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
pub mod context;
mod error;
pub mod memory;
mod metrics;
mod nexus;
pub mod spinlock;
pub mod stack;
mod tracing;
pub mod value;
pub mod wait;

pub use config::{RuntimeConfig, DEFAULT_CHUNK_SIZE, DEFAULT_STACK_CUSHION, DEFAULT_STACK_SIZE};
pub use context::{
    CallFrame, ContextHandle, ExecutionContext, FiberTransition, FiberWake, ThreadId, ThreadPhase,
};
pub use error::{ProtocolViolation, Result, VmError};
pub use metrics::{CollectionMetrics, ContextMetrics, NexusMetrics};
pub use nexus::{StoppedWorld, ThreadNexus};
pub use value::{ObjectRef, Value};
