//! # quota-throttler
//!
//! Client-side admission control for remote APIs that meter every operation
//! with its own leaky bucket.
//!
//! Each action has a burst capacity (`quota_max`) and a restore rate: the
//! server gives back one request every `restore_rate` seconds. The
//! [`Throttler`] tracks consumption per action and either sleeps until a call
//! fits (blocking mode) or records the call and lets it through anyway
//! (advisory mode). Optional priority tiers reserve slices of an action's
//! quota for more important callers.
//!
//! ## Quick start
//!
//! ```
//! use quota_throttler::{Params, QuotaLimit, Throttler};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let throttler = Throttler::<String>::builder()
//!     .limit("ListOrders", QuotaLimit::new(6, 60.0))
//!     .reserve("ListOrders", 0, 2)
//!     .reserve("ListOrders", 1, 4)
//!     .blocking(true)
//!     .build()
//!     .unwrap();
//!
//! throttler.admit("ListOrders", &Params::new(), 1).await.unwrap();
//! assert_eq!(throttler.level("ListOrders"), Some(1));
//! # });
//! ```
//!
//! ## Features
//!
//! - `ahash` (default): faster hashing for the per-action tables
//! - `bin`: dependencies of the `quota-throttler` demo binary

pub mod core;
pub mod executor;
pub mod throttler;
#[cfg(test)]
mod throttler_tests;

pub use crate::core::{
    Acquire, AdmissionState, BoxError, Clock, DEFAULT_LIMITS, LimitTable, ManualClock,
    MonotonicClock, PriorityTable, QuotaLedger, QuotaLimit, QuotaState, ThrottleError,
    default_limits,
};
pub use crate::executor::{
    AnyDelegate, CacheHook, CacheKey, MemoryCache, Params, RequestExecutor, SharedCache,
    SharedExecutor, cache_from_any, executor_from_any,
};
pub use crate::throttler::{ActionHandle, Throttler, ThrottlerBuilder};
