//! Minimum spacing between bus transactions.
//!
//! Back-to-back transfers make the adapter raise interrupts in tight
//! clusters, which shows up as scheduling jitter for everything else on the
//! core. The limiter keeps the completion time of the last transaction and
//! makes the next one wait until the configured interval has passed. This is
//! pacing, not mutual exclusion: two threads sharing a limiter may still
//! overlap on the hardware, so the [`Bus`](super::Bus) that owns the adapter
//! is what serialises transactions.

use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Default floor between the end of one transaction and the start of the
/// next.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_micros(250);

/// Tracks the last bus transaction on one physical bus.
///
/// Share it with `Arc` between every handle opened on the same adapter so
/// they pace against each other.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Configured minimum spacing.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Completion time of the most recent transaction, if any.
    pub fn last_completed(&self) -> Option<Instant> {
        *self.last.lock()
    }

    /// Block until the minimum interval since the last transaction has
    /// elapsed. Returns how long the caller was put to sleep.
    pub fn wait(&self) -> Duration {
        let remaining = match *self.last.lock() {
            Some(last) => self.min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
        remaining
    }

    /// Mark a transaction as completed now and give up the processor.
    pub fn record(&self) {
        *self.last.lock() = Some(Instant::now());
        thread::yield_now();
    }

    /// Run one transaction between [`wait`](Self::wait) and
    /// [`record`](Self::record). The completion is recorded whether the
    /// transaction succeeded or not; a NAK costs the bus as much as an ACK.
    pub fn pace<R>(&self, transaction: impl FnOnce() -> R) -> R {
        self.wait();
        let result = transaction();
        self.record();
        result
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}
