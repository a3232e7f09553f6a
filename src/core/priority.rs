//! Priority-tiered quota partitioning
//!
//! An action's quota can be split into per-tier shares. Tier 0 is the most
//! restricted class; every higher tier may additionally draw on the shares
//! of all tiers below it, so the effective cap of tier `p` is the sum of the
//! shares of tiers `0..=p`.
//!
//! ```text
//!     shares:  [5, 10]
//!     tier 0:  cap 5
//!     tier 1:  cap 15
//!     tier 7:  cap 15   (unconfigured tiers add nothing)
//! ```

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

/// Per-action reserved shares indexed by priority tier
#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    shares: HashMap<String, Vec<u64>>,
}

impl PriorityTable {
    /// Creates an empty table: every action uses its global `quota_max`
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the share reserved for `tier`
    ///
    /// Tiers between the current end of the table and `tier` are padded with
    /// zero shares.
    pub fn reserve(&mut self, action: impl Into<String>, tier: usize, share: u64) {
        let shares = self.shares.entry(action.into()).or_default();
        if shares.len() <= tier {
            shares.resize(tier + 1, 0);
        }
        shares[tier] = share;
    }

    /// Returns the cumulative cap for `tier`, or `None` if the action has
    /// no reservations
    pub fn cumulative_cap(&self, action: &str, tier: usize) -> Option<u64> {
        self.shares.get(action).map(|shares| {
            shares
                .iter()
                .take(tier.saturating_add(1))
                .fold(0u64, |cap, share| cap.saturating_add(*share))
        })
    }

    /// Returns the raw shares configured for an action
    pub fn shares(&self, action: &str) -> Option<&[u64]> {
        self.shares.get(action).map(Vec::as_slice)
    }

    /// Iterates over all actions that have reservations
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.shares.keys().map(String::as_str)
    }

    /// Returns true if no action has reservations
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}
