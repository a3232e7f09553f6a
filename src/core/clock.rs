//! Time sources for quota bookkeeping
//!
//! The ledger never reads the time itself; every operation takes an explicit
//! `now`. The throttler obtains `now` from a [`Clock`], which makes the
//! restore arithmetic testable with a [`ManualClock`].

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Source of the current time for the throttler
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time
    fn now(&self) -> SystemTime;
}

/// Wall-clock anchored, monotonically advancing clock
///
/// Captures the wall time once at construction and advances it with Tokio's
/// monotonic [`Instant`](tokio::time::Instant). Timestamps never go backwards
/// even if the system clock is adjusted, and they follow Tokio's paused test
/// clock so blocking waits can be exercised without real sleeps.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    wall: SystemTime,
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    /// Create a clock anchored at the current wall time
    pub fn new() -> Self {
        MonotonicClock {
            wall: SystemTime::now(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> SystemTime {
        self.wall + self.origin.elapsed()
    }
}

/// Manually driven clock
///
/// Clones share the same underlying time, so a test can hand one clone to the
/// throttler and keep another to move time around.
///
/// # Example
///
/// ```
/// use quota_throttler::{Clock, ManualClock};
/// use std::time::{Duration, SystemTime};
///
/// let clock = ManualClock::new(SystemTime::UNIX_EPOCH);
/// clock.advance(Duration::from_secs(5));
/// assert_eq!(clock.now(), SystemTime::UNIX_EPOCH + Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: SystemTime) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Move the clock backwards, simulating a wall-clock adjustment
    pub fn rewind(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.checked_sub(by).unwrap_or(SystemTime::UNIX_EPOCH);
    }

    /// Jump to an absolute time
    pub fn set(&self, to: SystemTime) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
