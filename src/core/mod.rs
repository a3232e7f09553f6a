//! Core components of the quota throttler
//!
//! This module contains the bookkeeping building blocks:
//! - [`limits`]: Static per-action quota limits and the default table
//! - [`priority`]: Cumulative per-tier reservations
//! - [`ledger`]: The leaky-bucket quota ledger
//! - [`clock`]: Time sources used by the ledger

pub mod clock;
pub mod ledger;
pub mod limits;
pub mod priority;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use ledger::{Acquire, AdmissionState, QuotaLedger, QuotaState};
pub use limits::{DEFAULT_LIMITS, LimitTable, QuotaLimit, default_limits};
pub use priority::PriorityTable;

use std::error::Error as StdError;

/// Boxed error produced by a request executor
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur while configuring or using the throttler
///
/// # Variants
///
/// - [`Configuration`](ThrottleError::Configuration): A limit or priority table is malformed
/// - [`TypeMismatch`](ThrottleError::TypeMismatch): A delegate lacks the required capability
/// - [`Cancelled`](ThrottleError::Cancelled): A blocking wait was abandoned
/// - [`Executor`](ThrottleError::Executor): The request executor itself failed
///
/// # Example
///
/// ```
/// use quota_throttler::{QuotaLimit, ThrottleError};
///
/// match QuotaLimit::new(0, 5.0).validate("ListOrders") {
///     Err(ThrottleError::Configuration(msg)) => println!("bad limit: {msg}"),
///     _ => {}
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// A limit or priority table entry is invalid
    #[error("invalid throttle configuration: {0}")]
    Configuration(String),

    /// A type-erased delegate did not provide the expected capability
    #[error("type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    /// The admission request was cancelled while waiting for quota
    #[error("admission for {action} cancelled while waiting for quota")]
    Cancelled { action: String },

    /// The delegate executor returned an error
    #[error("executor failed for {action}")]
    Executor {
        action: String,
        #[source]
        source: BoxError,
    },
}
