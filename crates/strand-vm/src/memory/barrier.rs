//! Generational write barrier and the remembered set it feeds.
//!
//! Storing a reference to a young object into an old one creates an
//! old-to-young edge a young collection would otherwise miss. The barrier
//! records the old object once; the [`RememberedSet`] then presents it as a
//! root until the next collection consumes it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use super::heap::{CollectBracket, GcData, Heap};
use crate::error::ProtocolViolation;
use crate::value::{ObjectRef, Value};

/// Objects that may hold references to younger objects.
#[derive(Debug, Default)]
pub struct RememberedSet {
    pending: SegQueue<ObjectRef>,
    /// Entries taken out of `pending` for the open cycle.
    staged: Mutex<Vec<ObjectRef>>,
    bracket: CollectBracket,
    recorded: AtomicU64,
}

impl RememberedSet {
    /// An empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: SegQueue::new(),
            staged: parking_lot::const_mutex(Vec::new()),
            bracket: CollectBracket::new(),
            recorded: AtomicU64::new(0),
        }
    }

    /// Add `obj` unless it is already present.
    ///
    /// # Safety
    ///
    /// `obj` is still allocated (see [`ObjectRef::object_type`]).
    pub unsafe fn record(&self, obj: ObjectRef) {
        // SAFETY: forwarded to the caller.
        if unsafe { obj.try_remember() } {
            self.pending.push(obj);
            self.recorded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entries waiting for the next cycle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Entries recorded since creation.
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

impl Heap for RememberedSet {
    fn name(&self) -> &'static str {
        "remembered_set"
    }

    fn collect_start(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.start(data)?;
        let mut staged = self.staged.lock();
        while let Some(obj) = self.pending.pop() {
            staged.push(obj);
        }
        Ok(())
    }

    fn collect_roots(
        &self,
        visit: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) -> Result<(), ProtocolViolation> {
        self.bracket.require_open("collect_roots")?;
        for slot in self.staged.lock().iter_mut() {
            *slot = visit(*slot);
        }
        Ok(())
    }

    fn collect_finish(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.finish(data)?;
        for obj in self.staged.lock().drain(..) {
            // SAFETY: staged entries were handed out as roots this cycle, so
            // the tracer kept their chunks, and chunks are only released
            // after every heap has finished.
            unsafe { obj.forget() };
        }
        Ok(())
    }
}

/// Record `target` if it is old and `value` is a young heap reference.
///
/// The common cases (immediate values, young targets, already remembered
/// targets) cost a tag test and one or two flag loads.
///
/// # Safety
///
/// `target` and any object `value` refers to are still allocated (see
/// [`ObjectRef::object_type`]).
#[inline]
pub unsafe fn write_barrier(remembered: &RememberedSet, target: ObjectRef, value: Value) {
    // SAFETY: the caller vouches for both objects.
    unsafe {
        if !target.is_old() || target.is_remembered() {
            return;
        }
        if value.as_object().is_some_and(|obj| obj.is_young()) {
            remembered.record(target);
        }
    }
}

/// A managed reference slot inside an object.
///
/// `init` is for the object's constructor, before the object can be old, and
/// skips the barrier. Every later store goes through `set`.
#[derive(Debug)]
#[repr(transparent)]
pub struct ManagedField {
    raw: AtomicUsize,
}

impl ManagedField {
    /// A slot holding `value`.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self {
            raw: AtomicUsize::new(value.raw()),
        }
    }

    /// Current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Value {
        // SAFETY: only `Value`s are ever stored.
        unsafe { Value::from_raw(self.raw.load(Ordering::Acquire)) }
    }

    /// Construction-time store. No barrier.
    #[inline]
    pub fn init(&self, value: Value) {
        self.raw.store(value.raw(), Ordering::Release);
    }

    /// Store `value` into this slot of `owner`, running the write barrier.
    ///
    /// # Safety
    ///
    /// As for [`write_barrier`].
    #[inline]
    pub unsafe fn set(&self, owner: ObjectRef, value: Value, remembered: &RememberedSet) {
        self.raw.store(value.raw(), Ordering::Release);
        // SAFETY: forwarded to the caller.
        unsafe { write_barrier(remembered, owner, value) };
    }
}

impl Default for ManagedField {
    fn default() -> Self {
        Self::new(Value::FALSE)
    }
}
