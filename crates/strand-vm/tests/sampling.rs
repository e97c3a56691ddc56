//! Checkpoint-driven profiling samples.

use strand_vm::context::{draw_interval, MAX_INTERVAL};
use strand_vm::{CallFrame, ExecutionContext, RuntimeConfig, ThreadNexus, Value};

// An interval never exceeds MAX_INTERVAL, so this many checkpoints always
// take at least one sample.
const ENOUGH: u64 = MAX_INTERVAL + 1;

#[test]
fn test_samples_attribute_current_method() {
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
    let method = Value::from_symbol(11);
    ctx.push_call_frame(CallFrame::new(method, Value::FALSE, 0))
        .unwrap();

    for _ in 0..ENOUGH {
        ctx.checkpoint().unwrap();
    }

    let profile = ctx.sampler().profile();
    assert!(profile.total() >= 1);
    assert_eq!(profile.count(method), profile.total());
    assert_eq!(profile.idle(), 0);
    assert_eq!(profile.hottest()[0].0, method);
    assert_eq!(ctx.metrics().samples, profile.total());
    assert_eq!(ctx.metrics().checkpoints, ENOUGH);
}

#[test]
fn test_samples_without_frames_count_as_idle() {
    let nexus = ThreadNexus::new(RuntimeConfig::default());
    let mut ctx = ExecutionContext::new(&nexus, "main").unwrap();
    for _ in 0..ENOUGH {
        ctx.checkpoint().unwrap();
    }
    let profile = ctx.sampler().profile();
    assert!(profile.idle() >= 1);
    assert_eq!(profile.idle(), profile.total());
    assert!(profile.hottest().is_empty());
}

#[test]
fn test_intervals_stay_bounded() {
    for _ in 0..1000 {
        assert!(draw_interval() <= MAX_INTERVAL);
    }
}
