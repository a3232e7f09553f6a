//! Leaky-bucket quota ledger
//!
//! This module provides [`QuotaLedger`], the authoritative per-action record
//! of consumed quota. Each metered action owns a [`QuotaState`] holding the
//! number of consumed units (`level`) and the time the level was last
//! brought up to date. Time restores one unit every `restore_rate` seconds;
//! the ledger applies the restoration lazily whenever an action is touched.
//!
//! Sub-unit progress is carried over between calls: `last_update` advances
//! by whole restore intervals only, so frequent polling never loses the
//! fraction of an interval that has already elapsed.

use super::{LimitTable, PriorityTable, QuotaLimit, ThrottleError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Mutable quota bookkeeping for one action
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaState {
    level: u64,
    last_update: SystemTime,
}

impl QuotaState {
    fn new(now: SystemTime) -> Self {
        QuotaState {
            level: 0,
            last_update: now,
        }
    }

    /// Consumed units not yet restored
    pub fn level(&self) -> u64 {
        self.level
    }

    /// Time up to which restoration has been accounted for
    pub fn last_update(&self) -> SystemTime {
        self.last_update
    }

    /// Time elapsed since `last_update`, zero if the clock moved backwards
    fn elapsed(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_update).unwrap_or(Duration::ZERO)
    }

    /// Applies restoration up to `now` and returns the units restored
    fn restore(&mut self, interval: Duration, now: SystemTime) -> u64 {
        let elapsed = match now.duration_since(self.last_update) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                tracing::warn!(
                    rewind = ?e.duration(),
                    "clock moved backwards, restoring nothing"
                );
                return 0;
            }
        };

        let units = elapsed.as_nanos() / interval.as_nanos().max(1);
        if units == 0 {
            return 0;
        }

        if units >= u128::from(self.level) {
            // An empty bucket accrues no credit
            let restored = self.level;
            self.level = 0;
            self.last_update = now;
            return restored;
        }

        // units < level, so it fits in u64 and the advance is at most `elapsed`
        let restored = units as u64;
        self.level -= restored;
        self.last_update += nanos_to_duration(interval.as_nanos() * units);
        restored
    }

    fn consume(&mut self, now: SystemTime) {
        if self.level == 0 && now > self.last_update {
            self.last_update = now;
        }
        self.level = self.level.saturating_add(1);
    }

    /// Time until one more unit fits under `cap`
    fn wait(&self, cap: u64, interval: Duration, now: SystemTime) -> Duration {
        let needed = self.level.saturating_add(1).saturating_sub(cap);
        if needed == 0 {
            return Duration::ZERO;
        }

        let total = interval.as_nanos().saturating_mul(u128::from(needed));
        let progress = self.elapsed(now).as_nanos();
        nanos_to_duration(total.saturating_sub(progress))
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    let secs = nanos / NANOS_PER_SEC;
    if secs > u128::from(u64::MAX) {
        return Duration::MAX;
    }
    Duration::new(secs as u64, (nanos % NANOS_PER_SEC) as u32)
}

/// Transient classification of an action at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    /// No limit configured; calls always pass
    Unmetered,
    /// The level is below the effective cap
    Ok,
    /// The level has reached the effective cap
    Wait,
}

/// Outcome of an admission attempt against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The action is unmetered; nothing was recorded
    Unmetered,
    /// One unit was consumed
    Admitted {
        /// Level after consumption
        level: u64,
        /// How long the call would have had to wait (advisory accounting only)
        advisory_wait: Duration,
    },
    /// Nothing was consumed; retry after the given duration
    Wait(Duration),
}

/// Authoritative per-action quota bookkeeping
///
/// Limits and priorities are fixed at construction and shared read-only.
/// Each metered action gets its own lock, created on first admission, so
/// contention on one action never slows down another.
///
/// # Example
///
/// ```
/// use quota_throttler::{Acquire, LimitTable, PriorityTable, QuotaLedger, QuotaLimit};
/// use std::time::{Duration, SystemTime};
///
/// let limits: LimitTable = [("ListOrders", QuotaLimit::new(2, 60.0))].into_iter().collect();
/// let ledger = QuotaLedger::new(limits, PriorityTable::new()).unwrap();
///
/// let now = SystemTime::now();
/// assert!(matches!(ledger.acquire("ListOrders", 0, now), Acquire::Admitted { .. }));
/// assert!(matches!(ledger.acquire("ListOrders", 0, now), Acquire::Admitted { .. }));
/// assert_eq!(
///     ledger.acquire("ListOrders", 0, now),
///     Acquire::Wait(Duration::from_secs(60))
/// );
/// ```
#[derive(Debug)]
pub struct QuotaLedger {
    limits: Arc<LimitTable>,
    priorities: Arc<PriorityTable>,
    states: RwLock<HashMap<String, Arc<Mutex<QuotaState>>>>,
}

impl QuotaLedger {
    /// Creates a ledger after validating both tables
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::Configuration`] if a limit is malformed or a
    /// priority reservation names an action without a limit.
    pub fn new(limits: LimitTable, priorities: PriorityTable) -> Result<Self, ThrottleError> {
        limits.validate()?;

        if let Some(action) = priorities.actions().find(|action| !limits.contains(action)) {
            return Err(ThrottleError::Configuration(format!(
                "{action}: priority reservations require a quota limit"
            )));
        }

        Ok(QuotaLedger {
            limits: Arc::new(limits),
            priorities: Arc::new(priorities),
            states: RwLock::new(HashMap::new()),
        })
    }

    /// The limit table this ledger enforces
    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    /// The priority table this ledger enforces
    pub fn priorities(&self) -> &PriorityTable {
        &self.priorities
    }

    /// Looks up the limit of an action, `None` if it is unmetered
    pub fn limit(&self, action: &str) -> Option<&QuotaLimit> {
        self.limits.get(action)
    }

    /// Returns the cap that applies to `priority`
    ///
    /// The cumulative tier reservation when the action has reservations,
    /// otherwise its `quota_max`. `None` for unmetered actions.
    pub fn effective_cap(&self, action: &str, priority: usize) -> Option<u64> {
        let limit = self.limits.get(action)?;
        Some(
            self.priorities
                .cumulative_cap(action, priority)
                .unwrap_or(limit.quota_max),
        )
    }

    /// Applies elapsed-time restoration and returns the units restored
    ///
    /// Returns `None` when the action has no state yet.
    pub fn restore(&self, action: &str, now: SystemTime) -> Option<u64> {
        let limit = self.limits.get(action)?;
        let state = self.existing_state(action)?;
        let restored = state.lock().restore(limit.restore_interval(), now);
        if restored > 0 {
            tracing::trace!(action, restored, "restored quota");
        }
        Some(restored)
    }

    /// Records one call against the action's quota
    ///
    /// Unmetered actions are ignored. Returns the new level.
    pub fn consume(&self, action: &str, now: SystemTime) -> Option<u64> {
        let limit = self.limits.get(action)?;
        let state = self.state(action, now);
        let mut state = state.lock();
        state.restore(limit.restore_interval(), now);
        state.consume(now);
        Some(state.level)
    }

    /// Returns how long a call at `priority` must wait before it fits
    ///
    /// Always zero for unmetered actions; never allocates state.
    pub fn wait(&self, action: &str, priority: usize, now: SystemTime) -> Duration {
        let Some((limit, cap)) = self.limit_and_cap(action, priority) else {
            return Duration::ZERO;
        };

        let interval = limit.restore_interval();
        match self.existing_state(action) {
            Some(state) => {
                let mut state = state.lock();
                state.restore(interval, now);
                state.wait(cap, interval, now)
            }
            None => QuotaState::new(now).wait(cap, interval, now),
        }
    }

    /// Consumes one unit only if the call fits under the cap right now
    ///
    /// The check and the consumption happen under the action's lock, so two
    /// callers can never both take the last unit.
    pub fn acquire(&self, action: &str, priority: usize, now: SystemTime) -> Acquire {
        let Some((limit, cap)) = self.limit_and_cap(action, priority) else {
            return Acquire::Unmetered;
        };

        let interval = limit.restore_interval();
        let state = self.state(action, now);
        let mut state = state.lock();
        state.restore(interval, now);

        let wait = state.wait(cap, interval, now);
        if !wait.is_zero() {
            return Acquire::Wait(wait);
        }

        state.consume(now);
        Acquire::Admitted {
            level: state.level,
            advisory_wait: Duration::ZERO,
        }
    }

    /// Consumes one unit regardless of the cap
    ///
    /// Used for advisory accounting: the returned `advisory_wait` says how
    /// long the call should have waited.
    pub fn record(&self, action: &str, priority: usize, now: SystemTime) -> Acquire {
        let Some((limit, cap)) = self.limit_and_cap(action, priority) else {
            return Acquire::Unmetered;
        };

        let interval = limit.restore_interval();
        let state = self.state(action, now);
        let mut state = state.lock();
        state.restore(interval, now);

        let advisory_wait = state.wait(cap, interval, now);
        state.consume(now);
        Acquire::Admitted {
            level: state.level,
            advisory_wait,
        }
    }

    /// Classifies the action for `priority` at `now`
    pub fn status(&self, action: &str, priority: usize, now: SystemTime) -> AdmissionState {
        let Some((limit, cap)) = self.limit_and_cap(action, priority) else {
            return AdmissionState::Unmetered;
        };

        let level = match self.existing_state(action) {
            Some(state) => {
                let mut state = state.lock();
                state.restore(limit.restore_interval(), now);
                state.level
            }
            None => 0,
        };

        if level < cap {
            AdmissionState::Ok
        } else {
            AdmissionState::Wait
        }
    }

    /// Current level without applying restoration
    pub fn level(&self, action: &str) -> Option<u64> {
        self.existing_state(action).map(|state| state.lock().level)
    }

    /// Snapshot of an action's state
    pub fn snapshot(&self, action: &str) -> Option<QuotaState> {
        self.existing_state(action).map(|state| state.lock().clone())
    }

    /// Number of actions with allocated state
    pub fn tracked_actions(&self) -> usize {
        self.states.read().len()
    }

    fn limit_and_cap(&self, action: &str, priority: usize) -> Option<(&QuotaLimit, u64)> {
        let limit = self.limits.get(action)?;
        let cap = self
            .priorities
            .cumulative_cap(action, priority)
            .unwrap_or(limit.quota_max);
        Some((limit, cap))
    }

    fn existing_state(&self, action: &str) -> Option<Arc<Mutex<QuotaState>>> {
        self.states.read().get(action).cloned()
    }

    fn state(&self, action: &str, now: SystemTime) -> Arc<Mutex<QuotaState>> {
        if let Some(state) = self.existing_state(action) {
            return state;
        }

        self.states
            .write()
            .entry(action.to_string())
            .or_insert_with(|| {
                tracing::debug!(action, "tracking quota");
                Arc::new(Mutex::new(QuotaState::new(now)))
            })
            .clone()
    }
}
