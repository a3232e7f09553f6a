//! Admission control in front of a remote API
//!
//! [`Throttler`] sits between callers and a [`RequestExecutor`]. Every call
//! goes through the same steps:
//!
//! ```text
//!     admit(action, params, priority)
//!          │
//!          ▼
//!     ┌──────────┐  hit
//!     │  Cache   │ ─────► cached response (no quota used)
//!     └────┬─────┘
//!          │ miss
//!          ▼
//!     ┌──────────┐  blocking: sleep, then recompute
//!     │  Ledger  │  advisory: record usage, never sleep
//!     └────┬─────┘
//!          │ admitted
//!          ▼
//!     ┌──────────┐
//!     │ Executor │ ─────► response (or None without an executor)
//!     └──────────┘
//! ```

use crate::core::{
    Acquire, AdmissionState, Clock, LimitTable, MonotonicClock, PriorityTable, QuotaLedger,
    QuotaLimit, ThrottleError, default_limits,
};
use crate::executor::{
    AnyDelegate, CacheHook, Params, RequestExecutor, SharedCache, SharedExecutor,
    cache_from_any, executor_from_any,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Client-side throttler for a quota-governed remote API
///
/// Cheap to share: wrap it in an [`Arc`] and call [`admit`](Throttler::admit)
/// from any number of tasks. Calls for different actions never contend;
/// calls for the same action are serialized only around the quota
/// bookkeeping, never around a sleep.
///
/// # Example
///
/// ```
/// use quota_throttler::{Params, QuotaLimit, Throttler};
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let throttler = Throttler::<String>::builder()
///     .limit("ListOrders", QuotaLimit::new(6, 60.0))
///     .blocking(true)
///     .build()
///     .unwrap();
///
/// // No executor configured: admission is accounted, nothing is returned
/// let response = throttler.admit("ListOrders", &Params::new(), 0).await.unwrap();
/// assert!(response.is_none());
/// assert_eq!(throttler.level("ListOrders"), Some(1));
/// # });
/// ```
pub struct Throttler<R> {
    ledger: QuotaLedger,
    blocking: AtomicBool,
    executor: Option<SharedExecutor<R>>,
    cache: Option<SharedCache<R>>,
    clock: Arc<dyn Clock>,
}

impl<R> Throttler<R>
where
    R: Send + Sync + 'static,
{
    /// Create a builder starting from [`default_limits`]
    pub fn builder() -> ThrottlerBuilder<R> {
        ThrottlerBuilder::new()
    }

    /// Admits a call, waiting for quota when blocking, then executes it
    ///
    /// Returns the cached response on a cache hit, the executor's response
    /// when an executor is configured, and `None` otherwise.
    ///
    /// # Errors
    ///
    /// - [`ThrottleError::Configuration`]: the priority tier has no quota share
    ///   at all, so a blocking wait could never end
    /// - [`ThrottleError::Executor`]: the executor failed
    pub async fn admit(
        &self,
        action: &str,
        params: &Params,
        priority: usize,
    ) -> Result<Option<R>, ThrottleError> {
        self.admit_inner(action, params, priority, None).await
    }

    /// Like [`admit`](Throttler::admit), but a blocking wait ends early with
    /// [`ThrottleError::Cancelled`] when `cancel` fires
    ///
    /// Quota is consumed only once the call is actually admitted, so an
    /// abandoned request leaves the ledger untouched.
    pub async fn admit_with_cancel(
        &self,
        action: &str,
        params: &Params,
        priority: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<R>, ThrottleError> {
        self.admit_inner(action, params, priority, Some(cancel))
            .await
    }

    async fn admit_inner(
        &self,
        action: &str,
        params: &Params,
        priority: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<R>, ThrottleError> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.lookup(action, params).await {
                tracing::debug!(action, "served from cache");
                return Ok(Some(cached));
            }
        }

        if self.is_blocking() {
            self.wait_for_quota(action, priority, cancel).await?;
        } else {
            self.account(action, priority);
        }

        let Some(executor) = &self.executor else {
            return Ok(None);
        };

        let response = executor
            .invoke(action, params)
            .await
            .map_err(|source| ThrottleError::Executor {
                action: action.to_string(),
                source,
            })?;

        if let Some(cache) = &self.cache {
            cache.store(action, params, &response);
        }

        Ok(Some(response))
    }

    async fn wait_for_quota(
        &self,
        action: &str,
        priority: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), ThrottleError> {
        if self.ledger.effective_cap(action, priority) == Some(0) {
            return Err(ThrottleError::Configuration(format!(
                "{action}: priority tier {priority} has no quota share"
            )));
        }

        loop {
            // The action lock is only held inside acquire, never across the sleep
            let wait = match self.ledger.acquire(action, priority, self.clock.now()) {
                Acquire::Unmetered => return Ok(()),
                Acquire::Admitted { level, .. } => {
                    tracing::debug!(action, priority, level, "admitted");
                    return Ok(());
                }
                Acquire::Wait(wait) => wait,
            };

            tracing::debug!(action, priority, wait = ?wait, "waiting for quota");

            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            tracing::debug!(action, priority, "admission cancelled");
                            return Err(ThrottleError::Cancelled {
                                action: action.to_string(),
                            });
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    fn account(&self, action: &str, priority: usize) {
        if let Acquire::Admitted {
            level,
            advisory_wait,
        } = self.ledger.record(action, priority, self.clock.now())
        {
            if advisory_wait.is_zero() {
                tracing::debug!(action, priority, level, "admitted");
            } else {
                tracing::debug!(
                    action,
                    priority,
                    level,
                    advisory_wait = ?advisory_wait,
                    "quota exceeded, passing through"
                );
            }
        }
    }

    /// A handle that issues calls for a single action
    pub fn action<'a>(&'a self, action: &'a str) -> ActionHandle<'a, R> {
        ActionHandle {
            throttler: self,
            action,
            priority: 0,
        }
    }

    /// How long a call at `priority` would have to wait right now
    pub fn wait(&self, action: &str, priority: usize) -> Duration {
        self.ledger.wait(action, priority, self.clock.now())
    }

    /// Classifies the action for `priority` right now
    pub fn status(&self, action: &str, priority: usize) -> AdmissionState {
        self.ledger.status(action, priority, self.clock.now())
    }

    /// Consumed units of an action, `None` before its first admission
    pub fn level(&self, action: &str) -> Option<u64> {
        self.ledger.restore(action, self.clock.now());
        self.ledger.level(action)
    }

    /// The underlying quota ledger
    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Returns true if `admit` sleeps until quota is available
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    /// Switches between blocking and advisory admission
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    /// Replaces the request executor
    pub fn set_executor(&mut self, executor: impl RequestExecutor<R> + 'static) {
        self.executor = Some(Arc::new(executor));
    }

    /// Replaces the request executor with an untyped delegate
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::TypeMismatch`] if the delegate is not a
    /// [`SharedExecutor<R>`]; the current executor is kept.
    pub fn set_executor_any(&mut self, delegate: AnyDelegate) -> Result<(), ThrottleError> {
        self.executor = Some(executor_from_any(delegate)?);
        Ok(())
    }

    /// Removes the executor; admitted calls then return `None`
    pub fn clear_executor(&mut self) {
        self.executor = None;
    }

    /// Replaces the cache hook
    pub fn set_cache(&mut self, cache: impl CacheHook<R> + 'static) {
        self.cache = Some(Arc::new(cache));
    }

    /// Replaces the cache hook with an untyped delegate
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::TypeMismatch`] if the delegate is not a
    /// [`SharedCache<R>`]; the current cache hook is kept.
    pub fn set_cache_any(&mut self, delegate: AnyDelegate) -> Result<(), ThrottleError> {
        self.cache = Some(cache_from_any(delegate)?);
        Ok(())
    }

    /// Removes the cache hook
    pub fn clear_cache(&mut self) {
        self.cache = None;
    }
}

/// Calls for one action at a fixed priority
///
/// ```
/// use quota_throttler::{Params, Throttler};
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let throttler = Throttler::<String>::builder().build().unwrap();
/// let orders = throttler.action("ListOrders").priority(1);
///
/// orders.admit(&Params::new()).await.unwrap();
/// assert_eq!(throttler.level("ListOrders"), Some(1));
/// # });
/// ```
pub struct ActionHandle<'a, R> {
    throttler: &'a Throttler<R>,
    action: &'a str,
    priority: usize,
}

impl<'a, R> ActionHandle<'a, R>
where
    R: Send + Sync + 'static,
{
    /// Uses `priority` for subsequent calls
    pub fn priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    /// Admits and executes a call for this action
    pub async fn admit(&self, params: &Params) -> Result<Option<R>, ThrottleError> {
        self.throttler.admit(self.action, params, self.priority).await
    }

    /// Admits a call, giving up when `cancel` fires
    pub async fn admit_with_cancel(
        &self,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Option<R>, ThrottleError> {
        self.throttler
            .admit_with_cancel(self.action, params, self.priority, cancel)
            .await
    }

    /// How long a call would have to wait right now
    pub fn wait(&self) -> Duration {
        self.throttler.wait(self.action, self.priority)
    }
}

/// Builder for configuring a [`Throttler`]
///
/// # Example
///
/// ```
/// use quota_throttler::{QuotaLimit, Throttler};
///
/// let throttler = Throttler::<String>::builder()
///     .limit("ListMatchingProducts", QuotaLimit::new(20, 5.0))
///     .reserve("ListMatchingProducts", 0, 5)
///     .reserve("ListMatchingProducts", 1, 10)
///     .blocking(true)
///     .build()
///     .unwrap();
///
/// assert_eq!(throttler.ledger().effective_cap("ListMatchingProducts", 1), Some(15));
/// ```
pub struct ThrottlerBuilder<R> {
    limits: LimitTable,
    priorities: PriorityTable,
    blocking: bool,
    executor: Option<SharedExecutor<R>>,
    cache: Option<SharedCache<R>>,
    clock: Arc<dyn Clock>,
}

impl<R> ThrottlerBuilder<R>
where
    R: Send + Sync + 'static,
{
    /// Starts from the default limit table, advisory mode, no collaborators
    pub fn new() -> Self {
        ThrottlerBuilder {
            limits: default_limits(),
            priorities: PriorityTable::new(),
            blocking: false,
            executor: None,
            cache: None,
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Replaces the whole limit table
    pub fn limits(mut self, limits: LimitTable) -> Self {
        self.limits = limits;
        self
    }

    /// Adds or overrides the limit of one action
    pub fn limit(mut self, action: impl Into<String>, limit: QuotaLimit) -> Self {
        self.limits.insert(action, limit);
        self
    }

    /// Removes the limit of one action, leaving it unmetered
    pub fn unmetered(mut self, action: &str) -> Self {
        self.limits.remove(action);
        self
    }

    /// Replaces the whole priority table
    pub fn priorities(mut self, priorities: PriorityTable) -> Self {
        self.priorities = priorities;
        self
    }

    /// Reserves `share` units of an action's quota for `tier`
    pub fn reserve(mut self, action: impl Into<String>, tier: usize, share: u64) -> Self {
        self.priorities.reserve(action, tier, share);
        self
    }

    /// Sleep until quota is available (`true`) or only account usage (`false`)
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Sets the executor that performs admitted calls
    pub fn executor(mut self, executor: impl RequestExecutor<R> + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Sets an executor that is already shared
    pub fn shared_executor(mut self, executor: SharedExecutor<R>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the executor from an untyped delegate
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::TypeMismatch`] if the delegate is not a
    /// [`SharedExecutor<R>`].
    pub fn executor_any(mut self, delegate: AnyDelegate) -> Result<Self, ThrottleError> {
        self.executor = Some(executor_from_any(delegate)?);
        Ok(self)
    }

    /// Sets the cache hook consulted before any quota interaction
    pub fn cache(mut self, cache: impl CacheHook<R> + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Sets a cache hook that is already shared
    pub fn shared_cache(mut self, cache: SharedCache<R>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the cache hook from an untyped delegate
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::TypeMismatch`] if the delegate is not a
    /// [`SharedCache<R>`].
    pub fn cache_any(mut self, delegate: AnyDelegate) -> Result<Self, ThrottleError> {
        self.cache = Some(cache_from_any(delegate)?);
        Ok(self)
    }

    /// Sets the time source
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validates the configuration and builds the throttler
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::Configuration`] if a limit is malformed or a
    /// reservation names an action without a limit.
    pub fn build(self) -> Result<Throttler<R>, ThrottleError> {
        let ledger = QuotaLedger::new(self.limits, self.priorities)?;

        tracing::info!(
            actions = ledger.limits().len(),
            blocking = self.blocking,
            executor = self.executor.is_some(),
            cache = self.cache.is_some(),
            "throttler configured"
        );

        Ok(Throttler {
            ledger,
            blocking: AtomicBool::new(self.blocking),
            executor: self.executor,
            cache: self.cache,
            clock: self.clock,
        })
    }
}

impl<R> Default for ThrottlerBuilder<R>
where
    R: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
