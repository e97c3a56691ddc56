//! Safepoint, allocation and stop-the-world costs.
//!
//! The checkpoint fast path runs at every call and loop back-edge of the
//! interpreter, so it is measured both with and without a frame on the stack
//! and while other threads are busy checkpointing.

use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use criterion::{criterion_group, criterion_main, Criterion};
use strand_vm::memory::{write_barrier, RememberedSet};
use strand_vm::value::ObjectType;
use strand_vm::{CallFrame, ExecutionContext, RuntimeConfig, ThreadNexus, Value};

fn benchmark_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint");
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let mut ctx = ExecutionContext::new(&nexus, "bench").unwrap();

    group.bench_function("idle", |b| {
        b.iter(|| black_box(ctx.checkpoint()).unwrap());
    });

    ctx.push_call_frame(CallFrame::new(Value::from_symbol(1), Value::FALSE, 4))
        .unwrap();
    group.bench_function("with_frame", |b| {
        b.iter(|| black_box(ctx.checkpoint()).unwrap());
    });

    group.bench_function("push_pop_frame", |b| {
        b.iter(|| {
            ctx.push_call_frame(CallFrame::new(Value::from_symbol(2), Value::FALSE, 2))
                .unwrap();
            black_box(ctx.pop_call_frame().unwrap());
        });
    });

    group.finish();
}

fn benchmark_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let mut ctx = ExecutionContext::new(&nexus, "bench").unwrap();

    group.bench_function("allocate_32", |b| {
        b.iter(|| black_box(ctx.allocate(32, ObjectType(1))).unwrap());
    });

    let remembered = RememberedSet::new();
    let old = ctx.allocate(16, ObjectType(1)).unwrap();
    // SAFETY: nothing collects during the benchmark, so every object
    // allocated here stays valid.
    unsafe { old.promote() };
    let young = Value::from_object(ctx.allocate(16, ObjectType(1)).unwrap());
    group.bench_function("write_barrier_remembered", |b| {
        b.iter(|| unsafe { write_barrier(&remembered, black_box(old), black_box(young)) });
    });
    group.bench_function("write_barrier_immediate", |b| {
        let target = ctx.allocate(16, ObjectType(1)).unwrap();
        b.iter(|| unsafe {
            write_barrier(&remembered, black_box(target), black_box(Value::from_int(3)));
        });
    });

    group.finish();
}

fn benchmark_stop_the_world(c: &mut Criterion) {
    const WORKERS: usize = 4;

    let mut group = c.benchmark_group("stop_the_world");
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let ready = Arc::new(Barrier::new(WORKERS + 1));
    let running = Arc::new(AtomicBool::new(true));

    let workers: Vec<_> = (0..WORKERS)
        .map(|i| {
            let nexus = Arc::clone(&nexus);
            let ready = Arc::clone(&ready);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let mut ctx = ExecutionContext::new(&nexus, &format!("worker-{i}")).unwrap();
                ready.wait();
                while running.load(Ordering::Acquire) {
                    ctx.checkpoint().unwrap();
                }
            })
        })
        .collect();

    let mut ctx = ExecutionContext::new(&nexus, "stopper").unwrap();
    ready.wait();

    group.bench_function("stop_release_4_workers", |b| {
        b.iter(|| drop(black_box(nexus.stop_the_world(&mut ctx).unwrap())));
    });

    running.store(false, Ordering::Release);
    for w in workers {
        w.join().unwrap();
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_checkpoint,
    benchmark_allocation,
    benchmark_stop_the_world
);
criterion_main!(benches);
