//! Full collection cycles driven through the collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use strand_vm::memory::{
    write_barrier, Chunk, CollectReason, Collector, CollectorWorker, GcData, GlobalRoots, Heap, ManagedField,
    RememberedSet, SharedHeap, ThreadLocalAllocator, Tracer,
};
use strand_vm::value::ObjectType;
use strand_vm::{
    CallFrame, ExecutionContext, ObjectRef, ProtocolViolation, RuntimeConfig, ThreadNexus, Value,
    VmError,
};

/// Copies every root it sees into fresh memory, once per object.
struct Evacuator {
    to_space: ThreadLocalAllocator,
    forwarded: HashMap<ObjectRef, ObjectRef>,
}

impl Evacuator {
    fn new(nexus: &ThreadNexus) -> Self {
        Self {
            to_space: ThreadLocalAllocator::new(Arc::clone(nexus.chunk_space())),
            forwarded: HashMap::new(),
        }
    }

}

impl Tracer for Evacuator {
    fn trace(&mut self, obj: ObjectRef) -> ObjectRef {
        if let Some(&copy) = self.forwarded.get(&obj) {
            return copy;
        }
        // SAFETY: roots point into chunks no sweep has released yet.
        unsafe {
            let size = obj.size();
            let copy = self
                .to_space
                .allocate(size, obj.object_type())
                .expect("to-space exhausted");
            // Both payloads are `size` bytes and never overlap.
            std::ptr::copy_nonoverlapping(obj.payload().as_ptr(), copy.payload().as_ptr(), size);
            copy.promote();
            self.forwarded.insert(obj, copy);
            copy
        }
    }

    fn chunk_live(&mut self, chunk: &Chunk) -> bool {
        self.forwarded.values().any(|&copy| chunk.contains(copy))
    }
}

fn write_payload(obj: ObjectRef, bytes: &[u8]) {
    // SAFETY: callers pass freshly allocated objects; the payload has room
    // for `bytes` and nothing else aliases it.
    unsafe {
        assert!(bytes.len() <= obj.size());
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), obj.payload().as_ptr(), bytes.len());
    }
}

fn read_payload(obj: ObjectRef) -> Vec<u8> {
    // SAFETY: the object is still allocated and its payload is `size()`
    // initialized bytes.
    unsafe { std::slice::from_raw_parts(obj.payload().as_ptr(), obj.size()) }.to_vec()
}

#[test]
fn test_moving_collection_updates_frames_and_globals() {
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
    let globals = Arc::new(GlobalRoots::new());

    let obj = ctx.allocate(4, ObjectType(3)).unwrap();
    write_payload(obj, &[1, 2, 3, 4]);
    let root = globals.add(Value::from_object(obj));

    let mut frame = CallFrame::new(Value::from_symbol(1), Value::from_int(0), 2);
    frame.locals[0] = Value::from_object(obj);
    frame.locals[1] = Value::from_int(77);
    ctx.push_call_frame(frame).unwrap();
    ctx.set_waiting_object(Value::from_object(obj));

    let collector = Collector::new(vec![
        Arc::clone(nexus.chunk_space()) as SharedHeap,
        Arc::clone(&globals) as SharedHeap,
    ]);
    let mut evacuator = Evacuator::new(&nexus);
    let stats = collector
        .collect(&mut ctx, &mut evacuator, CollectReason::Explicit)
        .unwrap();

    assert_eq!(stats.heaps, 3);
    assert_eq!(stats.roots_visited, 3);
    assert_eq!(stats.roots_moved, 3);
    assert_eq!(stats.threads_scanned, 1);
    assert_eq!(collector.last_metrics(), Some(stats));

    let moved = evacuator.forwarded[&obj];
    assert_ne!(moved, obj);
    assert!(unsafe { moved.is_old() });
    assert_eq!(read_payload(moved), vec![1, 2, 3, 4]);

    let frame = ctx.call_frame().unwrap().unwrap();
    assert_eq!(frame.locals[0].as_object(), Some(moved));
    assert_eq!(frame.locals[1], Value::from_int(77));
    assert_eq!(globals.get(root), Some(Value::from_object(moved)));
    assert_eq!(ctx.waiting_object(), Some(Value::from_object(moved)));
}

#[test]
fn test_collection_scans_parked_threads() {
    const WORKERS: usize = 2;

    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let ready = Arc::new(Barrier::new(WORKERS + 1));
    let running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let nexus = Arc::clone(&nexus);
            let ready = Arc::clone(&ready);
            let running = Arc::clone(&running);
            let tx = tx.clone();
            thread::spawn(move || {
                let mut ctx = ExecutionContext::new(&nexus, &format!("worker-{i}")).unwrap();
                let obj = ctx.allocate(8, ObjectType(5)).unwrap();
                let mut frame = CallFrame::new(Value::from_symbol(2), Value::FALSE, 1);
                frame.locals[0] = Value::from_object(obj);
                ctx.push_call_frame(frame).unwrap();
                tx.send(obj).unwrap();
                ready.wait();
                while running.load(Ordering::Acquire) {
                    ctx.checkpoint().unwrap();
                }
                ctx.call_frame().unwrap().unwrap().locals[0].as_object().unwrap()
            })
        })
        .collect();
    drop(tx);

    let originals: Vec<ObjectRef> = rx.iter().take(WORKERS).collect();
    let mut ctx = ExecutionContext::new(&nexus, "collector").unwrap();
    ready.wait();

    let collector = Collector::new(Vec::new());
    let mut evacuator = Evacuator::new(&nexus);
    let stats = collector
        .collect(&mut ctx, &mut evacuator, CollectReason::Explicit)
        .unwrap();
    assert_eq!(stats.threads_scanned, WORKERS + 1);
    assert_eq!(stats.roots_visited, WORKERS);

    running.store(false, Ordering::Release);
    for h in handles {
        let seen = h.join().unwrap();
        assert!(originals.iter().any(|o| evacuator.forwarded[o] == seen));
    }
}

#[test]
fn test_remembered_objects_are_roots_for_one_cycle() {
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
    let remembered = Arc::new(RememberedSet::new());

    let old = ctx.allocate(16, ObjectType(1)).unwrap();
    let young = ctx.allocate(16, ObjectType(1)).unwrap();

    let field = ManagedField::new(Value::FALSE);
    // SAFETY: no collection has run, so both objects are allocated.
    unsafe {
        old.promote();
        field.set(old, Value::from_object(young), &remembered);
        assert!(old.is_remembered());
        // A second store into the same object records nothing new.
        write_barrier(&remembered, old, Value::from_object(young));
    }
    assert_eq!(remembered.len(), 1);

    let collector = Collector::new(vec![Arc::clone(&remembered) as SharedHeap]);
    let mut seen = Vec::new();
    let stats = collector
        .collect(
            &mut ctx,
            &mut |o: ObjectRef| {
                seen.push(o);
                o
            },
            CollectReason::Explicit,
        )
        .unwrap();
    assert_eq!(seen, vec![old]);
    assert_eq!(stats.roots_moved, 0);
    assert_eq!(stats.bytes_released, 0);
    // SAFETY: the closure tracer keeps every chunk.
    assert!(!unsafe { old.is_remembered() });
    assert!(remembered.is_empty());
    assert_eq!(remembered.total_recorded(), 1);

    seen.clear();
    collector
        .collect(
            &mut ctx,
            &mut |o: ObjectRef| {
                seen.push(o);
                o
            },
            CollectReason::Explicit,
        )
        .unwrap();
    assert!(seen.is_empty());
}

/// Refuses to report roots.
#[derive(Debug, Default)]
struct BrokenHeap;

impl Heap for BrokenHeap {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn collect_start(&self, _data: &GcData) -> Result<(), ProtocolViolation> {
        Ok(())
    }

    fn collect_roots(
        &self,
        _visit: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) -> Result<(), ProtocolViolation> {
        Err(ProtocolViolation::NoOpenCycle {
            operation: "collect_roots",
        })
    }

    fn collect_finish(&self, _data: &GcData) -> Result<(), ProtocolViolation> {
        Ok(())
    }
}

#[test]
fn test_failing_heap_aborts_cycle_and_releases_world() {
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
    let globals = Arc::new(GlobalRoots::new());

    let mut collector = Collector::new(vec![Arc::clone(&globals) as SharedHeap]);
    collector.register(Arc::new(BrokenHeap));
    assert_eq!(collector.heap_count(), 2);

    let err = collector
        .collect(&mut ctx, &mut |o: ObjectRef| o, CollectReason::Explicit)
        .unwrap_err();
    assert_eq!(
        err,
        VmError::Protocol(ProtocolViolation::NoOpenCycle {
            operation: "collect_roots"
        })
    );
    assert!(!nexus.is_stop_requested());
    assert!(collector.last_metrics().is_none());

    // The globals bracket was closed again, so it can open for a new cycle.
    let data = GcData {
        cycle: 99,
        reason: CollectReason::Explicit,
    };
    globals.collect_start(&data).unwrap();
    globals.collect_finish(&data).unwrap();
    assert!(ctx.checkpoint().is_ok());
}

#[test]
fn test_roots_outside_bracket_are_rejected() {
    let globals = GlobalRoots::new();
    assert_eq!(
        globals.collect_roots(&mut |o| o),
        Err(ProtocolViolation::NoOpenCycle {
            operation: "collect_roots"
        })
    );

    let data = GcData {
        cycle: 1,
        reason: CollectReason::Requested,
    };
    globals.collect_start(&data).unwrap();
    assert_eq!(
        globals.collect_start(&data),
        Err(ProtocolViolation::CycleAlreadyOpen { open: 1 })
    );
    assert_eq!(
        globals.collect_finish(&GcData { cycle: 2, ..data }),
        Err(ProtocolViolation::CycleMismatch { open: 1, got: 2 })
    );
    globals.collect_finish(&data).unwrap();
}

#[test]
fn test_worker_collects_when_allocation_crosses_threshold() {
    let nexus = ThreadNexus::new(
        RuntimeConfig::default()
            .with_chunk_size(4096)
            .with_collect_threshold(8192),
    );
    let collector = Arc::new(Collector::new(vec![
        Arc::clone(nexus.chunk_space()) as SharedHeap,
    ]));
    let worker =
        CollectorWorker::spawn(&nexus, Arc::clone(&collector), |o: ObjectRef| o).unwrap();

    let mut ctx = ExecutionContext::new(&nexus, "mutator").unwrap();
    while nexus.metrics().collect_requests == 0 {
        ctx.allocate(3000, ObjectType(1)).unwrap();
    }

    // The mutator only cooperates through checkpoints.
    let deadline = Instant::now() + Duration::from_secs(10);
    while worker.cycles() == 0 && Instant::now() < deadline {
        ctx.checkpoint().unwrap();
        thread::yield_now();
    }
    assert_eq!(worker.cycles(), 1);
    assert_eq!(worker.failures(), 0);
    assert!(ctx.metrics().stops >= 1);
    assert_eq!(nexus.chunk_space().allocated_since_collect(), 0);
    assert_eq!(collector.last_metrics().unwrap().threads_scanned, 2);

    drop(ctx);
    assert!(worker.shutdown());
    assert!(nexus.is_empty());
}
