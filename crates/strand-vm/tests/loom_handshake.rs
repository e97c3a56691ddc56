//! Loom models of the stop/phase handshake.
//!
//! A thread entering the Managed phase stores its phase and then loads the
//! stop flag. A stopper stores the stop flag and then loads every phase.
//! With sequentially consistent accesses at least one side must see the
//! other, so a thread can never run Managed code while the stopper believes
//! it is out of the way.
//!
//! These models do not call into `ThreadNexus`. Each one rebuilds, with loom
//! atomics, the load/store sequence and orderings of a nexus path:
//! `enter_managed` and `leave_managed` for the mutator side, `stop_within`
//! for the stopper, and `acquire_ownership`/`release` for the owner word.
//! A change to those orderings in `src/nexus.rs` must be mirrored here.

use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use loom::sync::Arc;
use loom::thread;

const UNMANAGED: u8 = 1;
const MANAGED: u8 = 0;

#[test]
#[ignore = "loom test - run with cargo test --test loom_handshake -- --ignored --release"]
fn test_enter_managed_races_with_stop() {
    loom::model(|| {
        let stop = Arc::new(AtomicBool::new(false));
        let phase = Arc::new(AtomicU8::new(UNMANAGED));

        let mutator = {
            let stop = Arc::clone(&stop);
            let phase = Arc::clone(&phase);
            thread::spawn(move || {
                phase.store(MANAGED, Ordering::SeqCst);
                // Proceeds into managed code only if no stop is visible.
                !stop.load(Ordering::SeqCst)
            })
        };

        stop.store(true, Ordering::SeqCst);
        let stopper_saw_unmanaged = phase.load(Ordering::SeqCst) == UNMANAGED;

        let mutator_ran = mutator.join().unwrap();
        assert!(
            !(mutator_ran && stopper_saw_unmanaged),
            "mutator entered Managed code behind the stopper's back"
        );
    });
}

#[test]
#[ignore = "loom test - run with cargo test --test loom_handshake -- --ignored --release"]
fn test_single_stop_owner() {
    loom::model(|| {
        let owner = Arc::new(AtomicU32::new(0));

        let contenders: Vec<_> = (1..=2_u32)
            .map(|id| {
                let owner = Arc::clone(&owner);
                thread::spawn(move || {
                    owner
                        .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                })
            })
            .collect();

        let winners = contenders
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
        assert_ne!(owner.load(Ordering::Acquire), 0);
    });
}

#[test]
#[ignore = "loom test - run with cargo test --test loom_handshake -- --ignored --release"]
fn test_release_is_seen_after_park() {
    loom::model(|| {
        let stop = Arc::new(AtomicBool::new(true));
        let parked = Arc::new(AtomicBool::new(false));

        let mutator = {
            let stop = Arc::clone(&stop);
            let parked = Arc::clone(&parked);
            thread::spawn(move || {
                parked.store(true, Ordering::SeqCst);
                while stop.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            })
        };

        while !parked.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        stop.store(false, Ordering::SeqCst);
        mutator.join().unwrap();
    });
}
