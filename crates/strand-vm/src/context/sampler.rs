//! Statistical sampling driven by checkpoints.
//!
//! Each context counts checkpoints and takes a profiling sample every
//! `interval` of them. The interval is redrawn from the OS random source
//! after every sample so sampling never phase-locks with periodic code.

use std::collections::HashMap;

use crate::value::Value;

/// Upper bound of the per-draw right shift.
pub const MAX_SHIFT: u64 = 0xf;
/// Mask bounding every interval.
pub const MAX_INTERVAL: u64 = 0x1fff;

/// Draw a fresh sampling interval.
///
/// The random word is shifted right by its own low four bits and then masked,
/// so intervals are skewed toward small values but never exceed
/// [`MAX_INTERVAL`].
#[must_use]
pub fn draw_interval() -> u64 {
    let raw = getrandom::u32().map_or(MAX_INTERVAL, u64::from);
    shape_interval(raw)
}

#[inline]
const fn shape_interval(raw: u64) -> u64 {
    (raw >> (raw & MAX_SHIFT)) & MAX_INTERVAL
}

/// Samples recorded for one context.
#[derive(Debug, Default, Clone)]
pub struct Profile {
    total: u64,
    by_method: HashMap<Value, u64>,
    idle: u64,
}

impl Profile {
    fn record(&mut self, method: Option<Value>) {
        self.total += 1;
        match method {
            Some(m) => *self.by_method.entry(m).or_insert(0) += 1,
            None => self.idle += 1,
        }
    }

    /// Total samples taken.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Samples taken with no frame on the stack.
    #[must_use]
    pub const fn idle(&self) -> u64 {
        self.idle
    }

    /// Samples that landed in `method`.
    #[must_use]
    pub fn count(&self, method: Value) -> u64 {
        self.by_method.get(&method).copied().unwrap_or(0)
    }

    /// Methods ordered by sample count, hottest first.
    #[must_use]
    pub fn hottest(&self) -> Vec<(Value, u64)> {
        let mut v: Vec<_> = self.by_method.iter().map(|(&m, &n)| (m, n)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1));
        v
    }
}

/// Checkpoint-driven sampler state.
#[derive(Debug)]
pub struct Sampler {
    interval: u64,
    counter: u64,
    profile: Profile,
}

impl Sampler {
    /// A sampler with a freshly drawn interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_interval(draw_interval())
    }

    pub(crate) fn with_interval(interval: u64) -> Self {
        Self {
            interval,
            counter: 0,
            profile: Profile::default(),
        }
    }

    /// Current interval.
    #[must_use]
    pub const fn interval(&self) -> u64 {
        self.interval
    }

    /// Checkpoints counted since the last sample.
    #[must_use]
    pub const fn counter(&self) -> u64 {
        self.counter
    }

    /// Samples gathered so far.
    #[must_use]
    pub const fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Count one checkpoint. Returns `true` if a sample was taken.
    #[inline]
    pub fn tick(&mut self, method: impl FnOnce() -> Option<Value>) -> bool {
        let due = self.counter >= self.interval;
        self.counter += 1;
        if due {
            self.profile.record(method());
            self.reset(draw_interval());
        }
        due
    }

    pub(crate) const fn reset(&mut self, interval: u64) {
        self.interval = interval;
        self.counter = 0;
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}
