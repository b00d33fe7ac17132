//! Freshness policy for read-through access
//!
//! A [`FreshnessPolicy`] splits the age of a cached entry into three bands:
//!
//! - `age <= fresh_for`: served from cache with no network call
//! - `fresh_for < age <= keep_for`: served from cache while a conditional
//!   revalidation runs (in the background unless disabled)
//! - `age > keep_for`: evicted and fetched again unconditionally

use crate::cache::entry::CacheEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of a cached entry under a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    /// How long a validated value is served without asking the server
    pub fresh_for: Duration,

    /// How long a value may be kept at all before it is evicted
    pub keep_for: Duration,

    /// Revalidate stale entries in a spawned task instead of awaiting the round trip
    pub background_revalidation: bool,
}

impl Default for FreshnessPolicy {
    /// Matches the server's `Cache-Control: max-age=60`, kept for five minutes
    fn default() -> Self {
        Self {
            fresh_for: Duration::from_secs(60),
            keep_for: Duration::from_secs(300),
            background_revalidation: true,
        }
    }
}

impl FreshnessPolicy {
    pub fn new(fresh_for: Duration, keep_for: Duration) -> Self {
        Self {
            fresh_for,
            keep_for,
            background_revalidation: true,
        }
    }

    /// Every read awaits a conditional request; cached values are kept indefinitely
    pub fn conditional() -> Self {
        Self {
            fresh_for: Duration::ZERO,
            keep_for: Duration::MAX,
            background_revalidation: false,
        }
    }

    /// Every read returns the cached value at once and revalidates in the background
    pub fn always_revalidate() -> Self {
        Self {
            fresh_for: Duration::ZERO,
            keep_for: Duration::from_secs(300),
            background_revalidation: true,
        }
    }

    /// For values that rarely change (feature flags, theme)
    pub fn static_content() -> Self {
        Self {
            fresh_for: Duration::from_secs(3600),
            keep_for: Duration::from_secs(24 * 3600),
            background_revalidation: true,
        }
    }

    pub fn with_background_revalidation(mut self, enabled: bool) -> Self {
        self.background_revalidation = enabled;
        self
    }

    /// A zero `fresh_for` never yields [`Freshness::Fresh`]
    pub fn classify_age(&self, age: Duration) -> Freshness {
        if !self.fresh_for.is_zero() && age <= self.fresh_for {
            Freshness::Fresh
        } else if age <= self.keep_for {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    pub fn classify<T>(&self, entry: &CacheEntry<T>, now: DateTime<Utc>) -> Freshness {
        self.classify_age(entry.age_at(now))
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.keep_for < self.fresh_for {
            return Err(format!(
                "keep_for ({:?}) must not be shorter than fresh_for ({:?})",
                self.keep_for, self.fresh_for
            ));
        }
        Ok(())
    }
}
