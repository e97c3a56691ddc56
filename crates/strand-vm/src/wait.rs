//! Blocking primitives used while a context waits in the Unmanaged phase.
//!
//! Every wait here takes an `interrupted` predicate. Whoever wakes a waiter
//! for an interrupt sets the interrupt flag first and then notifies under the
//! same mutex the waiter checks under, so a wakeup is never lost between the
//! check and the sleep.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::value::Value;

// ============================================================================
// Park
// ============================================================================

/// A single-permit parking spot.
///
/// `unpark` before `park` leaves a permit behind, so the next `park` returns
/// immediately.
#[derive(Debug, Default)]
pub struct Park {
    permit: Mutex<bool>,
    cond: Condvar,
}

impl Park {
    /// A park with no permit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            permit: parking_lot::const_mutex(false),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available or `interrupted` returns `true`.
    ///
    /// Returns `true` if a permit was consumed.
    pub fn park(&self, interrupted: impl Fn() -> bool) -> bool {
        let mut permit = self.permit.lock();
        loop {
            if std::mem::take(&mut *permit) {
                return true;
            }
            if interrupted() {
                return false;
            }
            self.cond.wait(&mut permit);
        }
    }

    /// Like [`Park::park`] but gives up after `timeout`.
    pub fn park_timeout(&self, timeout: Duration, interrupted: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permit = self.permit.lock();
        loop {
            if std::mem::take(&mut *permit) {
                return true;
            }
            if interrupted() {
                return false;
            }
            if self.cond.wait_until(&mut permit, deadline).timed_out() {
                return std::mem::take(&mut *permit);
            }
        }
    }

    /// Leave a permit and wake the parked thread.
    pub fn unpark(&self) {
        *self.permit.lock() = true;
        self.cond.notify_all();
    }

    /// Wake the parked thread without leaving a permit, so it re-checks its
    /// interrupt predicate.
    pub fn notify(&self) {
        let _guard = self.permit.lock();
        self.cond.notify_all();
    }
}

// ============================================================================
// Channel
// ============================================================================

/// An unbounded multi-producer queue of values with blocking receive.
#[derive(Debug, Default)]
pub struct Channel {
    queue: Mutex<VecDeque<Value>>,
    ready: Condvar,
}

impl Channel {
    /// An empty channel.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: parking_lot::const_mutex(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Enqueue `value` and wake one receiver.
    pub fn send(&self, value: Value) {
        self.queue.lock().push_back(value);
        self.ready.notify_one();
    }

    /// Dequeue a value if one is ready.
    pub fn try_receive(&self) -> Option<Value> {
        self.queue.lock().pop_front()
    }

    /// Block until a value arrives or `interrupted` returns `true`.
    pub fn receive(&self, interrupted: impl Fn() -> bool) -> Option<Value> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                return Some(value);
            }
            if interrupted() {
                return None;
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Number of queued values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no value is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Wake every receiver so it re-checks its interrupt predicate.
    pub fn notify_waiters(&self) {
        let _guard = self.queue.lock();
        self.ready.notify_all();
    }
}

// ============================================================================
// Bounded polling
// ============================================================================

/// Poll `done` up to `limit` times, sleeping `interval` between attempts.
///
/// Returns `true` as soon as `done` does, `false` once the budget is spent.
pub fn limited_wait_for(limit: u32, interval: Duration, mut done: impl FnMut() -> bool) -> bool {
    for attempt in 0..limit {
        if done() {
            return true;
        }
        if attempt + 1 < limit {
            std::thread::sleep(interval);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unpark_before_park_leaves_permit() {
        let park = Park::new();
        park.unpark();
        assert!(park.park(|| false));
        assert!(!park.park_timeout(Duration::from_millis(1), || false));
    }

    #[test]
    fn test_park_returns_on_interrupt() {
        let park = Arc::new(Park::new());
        let flag = Arc::new(AtomicBool::new(false));
        let waiter = {
            let park = Arc::clone(&park);
            let flag = Arc::clone(&flag);
            thread::spawn(move || park.park(|| flag.load(Ordering::Acquire)))
        };
        flag.store(true, Ordering::Release);
        park.notify();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_channel_delivers_in_order() {
        let chan = Arc::new(Channel::new());
        let sender = {
            let chan = Arc::clone(&chan);
            thread::spawn(move || {
                for i in 0..3 {
                    chan.send(Value::from_int(i));
                }
            })
        };
        let got: Vec<_> = (0..3).map(|_| chan.receive(|| false).unwrap()).collect();
        sender.join().unwrap();
        assert_eq!(got, [Value::from_int(0), Value::from_int(1), Value::from_int(2)]);
        assert!(chan.is_empty());
    }

    #[test]
    fn test_limited_wait_for_gives_up() {
        let mut calls = 0;
        let ok = limited_wait_for(5, Duration::from_micros(1), || {
            calls += 1;
            false
        });
        assert!(!ok);
        assert_eq!(calls, 5);

        let mut n = 0;
        assert!(limited_wait_for(5, Duration::ZERO, || {
            n += 1;
            n == 2
        }));
    }
}
