//! Root regions: the global root table and the stack roots of a stopped world.

use std::cell::{Cell, RefCell};

use parking_lot::Mutex;

use super::heap::{CollectBracket, GcData, Heap};
use crate::error::ProtocolViolation;
use crate::nexus::StoppedWorld;
use crate::value::{ObjectRef, Value};

/// Handle to a slot in [`GlobalRoots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(usize);

#[derive(Debug, Default)]
struct Slots {
    values: Vec<Option<Value>>,
    free: Vec<usize>,
}

/// Long-lived roots shared by every thread: constants, globals, handles
/// held by native code.
#[derive(Debug, Default)]
pub struct GlobalRoots {
    slots: Mutex<Slots>,
    bracket: CollectBracket,
}

impl GlobalRoots {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root `value`, reusing a freed slot when one exists.
    pub fn add(&self, value: Value) -> RootId {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.free.pop() {
            slots.values[index] = Some(value);
            return RootId(index);
        }
        slots.values.push(Some(value));
        RootId(slots.values.len() - 1)
    }

    /// Current value of a root. A collection may have relocated it.
    #[must_use]
    pub fn get(&self, id: RootId) -> Option<Value> {
        self.slots.lock().values.get(id.0).copied().flatten()
    }

    /// Overwrite a live root. Returns `false` if `id` was removed.
    pub fn set(&self, id: RootId, value: Value) -> bool {
        match self.slots.lock().values.get_mut(id.0) {
            Some(slot) if slot.is_some() => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Drop a root and return its last value.
    pub fn remove(&self, id: RootId) -> Option<Value> {
        let mut slots = self.slots.lock();
        let value = slots.values.get_mut(id.0)?.take()?;
        slots.free.push(id.0);
        Some(value)
    }

    /// Live roots.
    #[must_use]
    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        slots.values.len() - slots.free.len()
    }

    /// Whether no root is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Heap for GlobalRoots {
    fn name(&self) -> &'static str {
        "global_roots"
    }

    fn collect_start(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.start(data)
    }

    fn collect_roots(
        &self,
        visit: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) -> Result<(), ProtocolViolation> {
        self.bracket.require_open("collect_roots")?;
        for slot in self.slots.lock().values.iter_mut().flatten() {
            *slot = slot.map_object(&mut *visit);
        }
        Ok(())
    }

    fn collect_finish(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.finish(data)
    }
}

/// The frame roots of every context covered by a [`StoppedWorld`].
///
/// Built per cycle by the collector; it cannot outlive the stop.
pub struct StackRoots<'w, 's> {
    world: RefCell<&'w mut StoppedWorld<'s>>,
    bracket: CollectBracket,
    scanned: Cell<usize>,
}

impl<'w, 's> StackRoots<'w, 's> {
    /// Wrap a stopped world.
    pub fn new(world: &'w mut StoppedWorld<'s>) -> Self {
        Self {
            world: RefCell::new(world),
            bracket: CollectBracket::new(),
            scanned: Cell::new(0),
        }
    }

    /// Contexts whose frames were visited by the last `collect_roots`.
    #[must_use]
    pub fn threads_scanned(&self) -> usize {
        self.scanned.get()
    }
}

impl Heap for StackRoots<'_, '_> {
    fn name(&self) -> &'static str {
        "stack_roots"
    }

    fn collect_start(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.start(data)
    }

    fn collect_roots(
        &self,
        visit: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) -> Result<(), ProtocolViolation> {
        self.bracket.require_open("collect_roots")?;
        let scanned = self.world.borrow_mut().visit_roots(visit);
        self.scanned.set(scanned);
        Ok(())
    }

    fn collect_finish(&self, data: &GcData) -> Result<(), ProtocolViolation> {
        self.bracket.finish(data)
    }
}

impl std::fmt::Debug for StackRoots<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackRoots")
            .field("open", &self.bracket.is_open())
            .field("scanned", &self.scanned.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_reused() {
        let roots = GlobalRoots::new();
        let a = roots.add(Value::from_int(1));
        let b = roots.add(Value::from_int(2));
        assert_eq!(roots.len(), 2);

        assert_eq!(roots.remove(a), Some(Value::from_int(1)));
        assert_eq!(roots.remove(a), None);
        assert!(!roots.set(a, Value::TRUE));

        let c = roots.add(Value::from_int(3));
        assert_eq!(c, a);
        assert_eq!(roots.get(b), Some(Value::from_int(2)));
        assert_eq!(roots.get(c), Some(Value::from_int(3)));
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_collect_roots_outside_bracket_rejected() {
        let roots = GlobalRoots::new();
        roots.add(Value::from_int(1));
        assert_eq!(
            roots.collect_roots(&mut |o| o),
            Err(ProtocolViolation::NoOpenCycle {
                operation: "collect_roots"
            })
        );
    }
}
