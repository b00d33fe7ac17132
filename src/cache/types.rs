//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache key type - canonical string built by [`CacheKeyBuilder`](crate::cache::CacheKeyBuilder)
pub type CacheKey = String;

/// Read-only diagnostics for a cache store
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently cached
    pub entries: usize,

    /// Number of cached entries that carry an ETag
    pub etags: usize,

    /// Reads answered from cache without a network call
    pub hits: u64,

    /// Reads that found nothing cached
    pub misses: u64,

    /// `304 Not Modified` responses resolved to a cached value
    pub not_modified: u64,

    /// Background revalidations started for stale entries
    pub revalidations: u64,

    /// Cached values served because the network failed
    pub stale_served: u64,

    /// Entries dropped because they outlived their keep window or were superseded by a 404
    pub evictions: u64,

    /// Entries removed by explicit invalidation
    pub invalidations: u64,
}

impl CacheStats {
    /// Cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Cache miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Bump the counter for `event`
    pub fn count(&mut self, event: CacheEvent) {
        match event {
            CacheEvent::Hit => self.hits += 1,
            CacheEvent::Miss => self.misses += 1,
            CacheEvent::NotModified => self.not_modified += 1,
            CacheEvent::Revalidation => self.revalidations += 1,
            CacheEvent::StaleServed => self.stale_served += 1,
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ entries: {}, etags: {}, hits: {}, misses: {}, hit_rate: {:.2}%, not_modified: {}, stale_served: {}, evictions: {} }}",
            self.entries,
            self.etags,
            self.hits,
            self.misses,
            self.hit_rate(),
            self.not_modified,
            self.stale_served,
            self.evictions
        )
    }
}

/// Counted cache events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Hit,
    Miss,
    NotModified,
    Revalidation,
    StaleServed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..CacheStats::default()
        };

        assert_eq!(stats.hit_rate(), 80.0);
        assert_eq!(stats.miss_rate(), 20.0);
    }

    #[test]
    fn test_cache_stats_zero_requests() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 100.0);
    }

    #[test]
    fn test_count_events() {
        let mut stats = CacheStats::default();
        stats.count(CacheEvent::Hit);
        stats.count(CacheEvent::NotModified);
        stats.count(CacheEvent::NotModified);
        stats.count(CacheEvent::StaleServed);

        assert_eq!(stats.hits, 1);
        assert_eq!(stats.not_modified, 2);
        assert_eq!(stats.stale_served, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            entries: 2,
            etags: 1,
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        let display = stats.to_string();
        assert!(display.contains("entries: 2"));
        assert!(display.contains("hit_rate: 75.00%"));
    }
}
