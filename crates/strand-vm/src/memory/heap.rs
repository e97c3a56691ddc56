//! The capability every memory region exposes to a collection cycle.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ProtocolViolation;
use crate::value::ObjectRef;

/// Why a collection cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectReason {
    /// Called directly by the embedder.
    Explicit,
    /// An allocator asked for it through `gc_soon`.
    Requested,
}

impl CollectReason {
    /// Short name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Requested => "requested",
        }
    }
}

/// Per-cycle information handed to every heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcData {
    /// Cycle number; starts at 1.
    pub cycle: u64,
    /// What triggered the cycle.
    pub reason: CollectReason,
}

/// A memory region that takes part in collection.
///
/// A cycle calls, in order, `collect_start` once, `collect_roots` any number
/// of times and `collect_finish` once. The orchestrator guarantees that every
/// Managed context is parked for the whole cycle. Calls out of that order are
/// reported as [`ProtocolViolation`]s rather than acted on.
pub trait Heap {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Open the bracket for `data.cycle`.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::CycleAlreadyOpen`] if a cycle is already open.
    fn collect_start(&self, data: &GcData) -> Result<(), ProtocolViolation>;

    /// Pass every root this region owns through `visit` and store back the
    /// reference it returns.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NoOpenCycle`] outside a bracket.
    fn collect_roots(
        &self,
        visit: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) -> Result<(), ProtocolViolation>;

    /// Close the bracket for `data.cycle`.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NoOpenCycle`] with no bracket open, or
    /// [`ProtocolViolation::CycleMismatch`] if another cycle is open.
    fn collect_finish(&self, data: &GcData) -> Result<(), ProtocolViolation>;
}

/// Open/closed tracker a [`Heap`] implementation embeds.
#[derive(Debug, Default)]
pub struct CollectBracket {
    /// Open cycle number, or 0 when closed.
    open: AtomicU64,
}

impl CollectBracket {
    /// A closed bracket.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            open: AtomicU64::new(0),
        }
    }

    /// Open the bracket for `data.cycle`.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::CycleAlreadyOpen`] if already open.
    pub fn start(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        debug_assert!(data.cycle != 0, "cycle numbers start at 1");
        self.open
            .compare_exchange(0, data.cycle, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|open| ProtocolViolation::CycleAlreadyOpen { open })
    }

    /// The open cycle.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NoOpenCycle`] naming `operation` when closed.
    pub fn require_open(&self, operation: &'static str) -> Result<u64, ProtocolViolation> {
        match self.open.load(Ordering::Acquire) {
            0 => Err(ProtocolViolation::NoOpenCycle { operation }),
            cycle => Ok(cycle),
        }
    }

    /// Close the bracket opened for `data.cycle`.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::NoOpenCycle`] or [`ProtocolViolation::CycleMismatch`].
    pub fn finish(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        let open = self.require_open("collect_finish")?;
        self.open
            .compare_exchange(data.cycle, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ProtocolViolation::CycleMismatch {
                open,
                got: data.cycle,
            })
    }

    /// Whether a cycle is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) != 0
    }
}
