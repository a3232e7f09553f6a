//! Static quota limits per remote action
//!
//! Every remote operation is governed by its own leaky bucket: a burst
//! capacity (`quota_max`) and the number of seconds it takes the server to
//! restore one consumed request (`restore_rate`). Actions missing from the
//! [`LimitTable`] are not metered at all.

use super::ThrottleError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

/// Quota limits for a single action
///
/// # Example
///
/// ```
/// use quota_throttler::QuotaLimit;
/// use std::time::Duration;
///
/// // 20 request burst, one request restored every 5 seconds
/// let limit = QuotaLimit::new(20, 5.0).with_hourly_max(720);
/// assert_eq!(limit.restore_interval(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimit {
    /// Burst capacity: requests that may be made back to back
    pub quota_max: u64,
    /// Seconds needed to restore one request (may be fractional)
    pub restore_rate: f64,
    /// Declared hourly ceiling. Recorded for reference only, never enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_max: Option<u64>,
}

impl QuotaLimit {
    /// Creates a limit without an hourly ceiling
    pub const fn new(quota_max: u64, restore_rate: f64) -> Self {
        QuotaLimit {
            quota_max,
            restore_rate,
            hourly_max: None,
        }
    }

    /// Sets the declared hourly ceiling
    pub const fn with_hourly_max(mut self, hourly_max: u64) -> Self {
        self.hourly_max = Some(hourly_max);
        self
    }

    /// Returns the time needed to restore one unit of quota
    ///
    /// Invalid rates (zero, negative, non-finite or too large) yield
    /// [`Duration::MAX`], which effectively never restores anything.
    pub fn restore_interval(&self) -> Duration {
        match Duration::try_from_secs_f64(self.restore_rate) {
            Ok(interval) if !interval.is_zero() => interval,
            _ => Duration::MAX,
        }
    }

    /// Checks that the limit can be used for bookkeeping
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::Configuration`] when `quota_max` is zero or
    /// `restore_rate` is not a positive finite number of seconds.
    pub fn validate(&self, action: &str) -> Result<(), ThrottleError> {
        if self.quota_max == 0 {
            return Err(ThrottleError::Configuration(format!(
                "{action}: quota_max must be at least 1"
            )));
        }

        if !self.restore_rate.is_finite() || self.restore_rate <= 0.0 {
            return Err(ThrottleError::Configuration(format!(
                "{action}: restore_rate must be a positive number of seconds, got {}",
                self.restore_rate
            )));
        }

        if self.restore_interval() == Duration::MAX {
            return Err(ThrottleError::Configuration(format!(
                "{action}: restore_rate {} is out of range",
                self.restore_rate
            )));
        }

        Ok(())
    }
}

/// Mapping from action name to its [`QuotaLimit`]
///
/// Start from [`default_limits`] and override individual actions, or build a
/// table from scratch.
///
/// ```
/// use quota_throttler::{LimitTable, QuotaLimit, default_limits};
///
/// let mut limits = default_limits();
/// limits.insert("ListOrders", QuotaLimit::new(6, 30.0));
/// assert_eq!(limits.get("ListOrders").unwrap().restore_rate, 30.0);
///
/// let custom: LimitTable = [("Ping", QuotaLimit::new(1, 1.0))].into_iter().collect();
/// assert!(custom.get("ListOrders").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    limits: HashMap<String, QuotaLimit>,
}

impl LimitTable {
    /// Creates an empty table: every action is unmetered
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the limit for an action
    pub fn insert(&mut self, action: impl Into<String>, limit: QuotaLimit) -> Option<QuotaLimit> {
        self.limits.insert(action.into(), limit)
    }

    /// Removes an action, making it unmetered
    pub fn remove(&mut self, action: &str) -> Option<QuotaLimit> {
        self.limits.remove(action)
    }

    /// Looks up the limit for an action
    pub fn get(&self, action: &str) -> Option<&QuotaLimit> {
        self.limits.get(action)
    }

    /// Returns true if the action is metered
    pub fn contains(&self, action: &str) -> bool {
        self.limits.contains_key(action)
    }

    /// Number of metered actions
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Returns true if no action is metered
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Iterates over all `(action, limit)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &QuotaLimit)> {
        self.limits.iter().map(|(action, limit)| (action.as_str(), limit))
    }

    /// Validates every entry
    ///
    /// # Errors
    ///
    /// Returns the first [`ThrottleError::Configuration`] encountered.
    pub fn validate(&self) -> Result<(), ThrottleError> {
        self.iter().try_for_each(|(action, limit)| limit.validate(action))
    }
}

impl<S: Into<String>> FromIterator<(S, QuotaLimit)> for LimitTable {
    fn from_iter<I: IntoIterator<Item = (S, QuotaLimit)>>(iter: I) -> Self {
        let mut table = LimitTable::new();
        table.extend(iter);
        table
    }
}

impl<S: Into<String>> Extend<(S, QuotaLimit)> for LimitTable {
    fn extend<I: IntoIterator<Item = (S, QuotaLimit)>>(&mut self, iter: I) {
        for (action, limit) in iter {
            self.insert(action, limit);
        }
    }
}

const fn limit(quota_max: u64, restore_rate: f64) -> QuotaLimit {
    QuotaLimit::new(quota_max, restore_rate)
}

/// Published throttling limits of the seller API operations
pub const DEFAULT_LIMITS: &[(&str, QuotaLimit)] = &[
    // Products
    ("ListMatchingProducts", limit(20, 5.0).with_hourly_max(720)),
    ("GetMatchingProduct", limit(20, 0.5).with_hourly_max(7200)),
    ("GetMatchingProductForId", limit(20, 0.2).with_hourly_max(18000)),
    ("GetCompetitivePricingForSKU", limit(20, 0.1).with_hourly_max(36000)),
    ("GetCompetitivePricingForASIN", limit(20, 0.1).with_hourly_max(36000)),
    ("GetLowestOfferListingsForSKU", limit(20, 0.1).with_hourly_max(36000)),
    ("GetLowestOfferListingsForASIN", limit(20, 0.1).with_hourly_max(36000)),
    ("GetLowestPricedOffersForSKU", limit(10, 0.2).with_hourly_max(200)),
    ("GetLowestPriceOffersForASIN", limit(10, 0.2).with_hourly_max(36000)),
    ("GetMyFeesEstimate", limit(20, 0.1).with_hourly_max(36000)),
    ("GetMyPriceForSKU", limit(20, 0.1).with_hourly_max(36000)),
    ("GetMyPriceForASIN", limit(20, 0.1).with_hourly_max(36000)),
    ("GetProductCategoriesForSKU", limit(20, 5.0).with_hourly_max(720)),
    ("GetProductCategoriesForASIN", limit(20, 5.0).with_hourly_max(720)),
    ("GetServiceStatus", limit(2, 300.0)),
    // Product Advertising
    ("ItemLookup", limit(1, 1.0)),
    ("ItemSearch", limit(1, 1.0)),
    // Fulfillment Inventory
    ("ListInventorySupply", limit(30, 0.5)),
    ("ListInventorySupplyByNextToken", limit(30, 0.5)),
    // Reports
    ("RequestReport", limit(15, 60.0).with_hourly_max(60)),
    ("GetReportRequestList", limit(10, 45.0).with_hourly_max(80)),
    ("GetReportRequestListByNextToken", limit(30, 2.0).with_hourly_max(1800)),
    ("GetReportRequestCount", limit(10, 45.0).with_hourly_max(80)),
    ("CancelReportRequests", limit(10, 45.0).with_hourly_max(80)),
    ("GetReportList", limit(10, 60.0).with_hourly_max(60)),
    ("GetReportListByNextToken", limit(30, 2.0).with_hourly_max(1800)),
    ("GetReportCount", limit(10, 45.0).with_hourly_max(80)),
    ("GetReport", limit(15, 60.0).with_hourly_max(60)),
    ("ManageReportSchedule", limit(10, 45.0).with_hourly_max(80)),
    ("GetReportScheduleList", limit(10, 45.0).with_hourly_max(80)),
    ("GetReportScheduleListByNextToken", limit(30, 2.0).with_hourly_max(1800)),
    ("GetReportScheduleCount", limit(10, 45.0).with_hourly_max(80)),
    ("UpdateReportAcknowledgements", limit(10, 45.0).with_hourly_max(80)),
    // Orders
    ("ListOrders", limit(6, 60.0)),
    ("ListOrdersByNextToken", limit(6, 60.0)),
    ("GetOrder", limit(6, 60.0)),
    ("ListOrderItems", limit(30, 2.0)),
    ("ListOrderItemsByNextToken", limit(30, 2.0)),
    // Fulfillment Inbound Shipment
    ("ListInboundShipments", limit(30, 0.5)),
    ("ListInboundShipmentsByNextToken", limit(30, 0.5)),
    ("ListInboundShipmentItems", limit(30, 0.5)),
    ("ListInboundShipmentItemsByNextToken", limit(30, 0.5)),
    ("GetTransportContent", limit(30, 0.5)),
];

/// Returns a fresh copy of [`DEFAULT_LIMITS`] as an owned table
pub fn default_limits() -> LimitTable {
    DEFAULT_LIMITS.iter().copied().collect()
}
