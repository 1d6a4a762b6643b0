//! Stream completion events.
//!
//! An [`EventSignal`] is a monotonically increasing 64-bit counter recorded
//! after each kernel batch. Waiters block until the counter reaches a target
//! value; the allocator compares pending release fences against it to decide
//! when freed memory may be reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use snafu::ensure;

use crate::error::{EventTimeoutSnafu, Result};

/// Monotone completion counter for one stream.
///
/// `signal` never decreases the value; concurrent completions of a batch may
/// signal out of order, so the stored value is the running maximum.
#[derive(Debug, Default)]
pub struct EventSignal {
    value: AtomicU64,
    // The mutex guards nothing; it only backs the condvar.
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl EventSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Record completion of everything up to `value`.
    pub fn signal(&self, value: u64) {
        self.value.fetch_max(value, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    /// Whether `target` has been reached without blocking.
    pub fn reached(&self, target: u64) -> bool {
        self.value() >= target
    }

    /// Block until the counter reaches `target`.
    pub fn wait(&self, target: u64) {
        if self.reached(target) {
            return;
        }
        let mut guard = self.mutex.lock();
        while !self.reached(target) {
            self.condvar.wait(&mut guard);
        }
    }

    /// Block until the counter reaches `target` or `timeout_ms` elapses.
    pub fn wait_timeout(&self, target: u64, timeout_ms: u64) -> Result<()> {
        if self.reached(target) {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut guard = self.mutex.lock();
        while !self.reached(target) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            ensure!(
                !remaining.is_zero(),
                EventTimeoutSnafu { target, current: self.value(), timeout_ms }
            );
            self.condvar.wait_for(&mut guard, remaining);
        }
        Ok(())
    }
}
