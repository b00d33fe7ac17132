//! Cache store keyed by canonical request keys
//!
//! The store owns every [`CacheEntry`] and hands out clones. All writes go
//! through [`CacheStore::put`] and friends, which compare the writer's
//! [`RequestTicket`] against the stored entry and the last invalidation so a
//! slow response can never replace a newer value.

use crate::cache::{
    entry::{CacheEntry, RequestTicket},
    types::{CacheEvent, CacheKey, CacheStats},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Shared cache of conditionally fetched values
pub struct CacheStore<T> {
    state: Arc<RwLock<StoreState<T>>>,
    clock: Arc<AtomicU64>,
}

impl<T> Clone for CacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

/// Internal cache storage
struct StoreState<T> {
    /// Main storage: key -> entry
    entries: HashMap<CacheKey, CacheEntry<T>>,

    /// Logical time each key was last invalidated
    invalidated_at: HashMap<CacheKey, u64>,

    /// Logical time of the last full clear
    cleared_at: u64,

    /// Event counters
    stats: CacheStats,
}

impl<T> StoreState<T> {
    fn invalidated_after(&self, key: &str, ticket: &RequestTicket) -> bool {
        let key_invalidation = self.invalidated_at.get(key).copied().unwrap_or(0);
        key_invalidation.max(self.cleared_at) > ticket.sequence
    }
}

impl<T: Clone> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CacheStore<T> {
    pub fn new() -> Self {
        let state = StoreState {
            entries: HashMap::new(),
            invalidated_at: HashMap::new(),
            cleared_at: 0,
            stats: CacheStats::default(),
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamp a request about to be sent
    pub fn issue_ticket(&self) -> RequestTicket {
        RequestTicket {
            sequence: self.tick(),
            issued_at: Utc::now(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clone of the entry stored under `key`
    pub async fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        let state = self.state.read().await;
        state.entries.get(key).cloned()
    }

    /// ETag to send as `If-None-Match` for `key`
    pub async fn etag(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        state.entries.get(key).and_then(|entry| entry.etag.clone())
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let state = self.state.read().await;
        state.entries.contains_key(key)
    }

    /// Whether `key` was invalidated, evicted or cleared after `ticket` was issued
    pub async fn invalidated_since(&self, key: &str, ticket: &RequestTicket) -> bool {
        let state = self.state.read().await;
        state.invalidated_after(key, ticket)
    }

    /// Store a value received with a `200`.
    ///
    /// Returns `false` when the write was discarded because the stored entry
    /// or an invalidation is newer than `ticket`.
    pub async fn put(
        &self,
        key: &str,
        value: T,
        etag: Option<String>,
        ticket: RequestTicket,
        tags: &[String],
    ) -> bool {
        let mut state = self.state.write().await;

        if state.invalidated_after(key, &ticket) {
            debug!("Discarding response for {}: invalidated after request was sent", key);
            return false;
        }
        if let Some(existing) = state.entries.get(key) {
            if existing.is_newer_than(&ticket) {
                debug!("Discarding response for {}: a newer response is cached", key);
                return false;
            }
        }

        let mut entry = CacheEntry::new(value, etag, ticket);
        for tag in tags {
            entry.add_tag(tag.clone());
        }

        debug!("Caching {} (etag: {:?})", key, entry.etag);
        state.entries.insert(key.to_string(), entry);
        true
    }

    /// Record a `304` for `key` and return the confirmed value.
    ///
    /// `None` when nothing is cached or the key was invalidated after the
    /// request was sent.
    pub async fn mark_not_modified(&self, key: &str, ticket: RequestTicket) -> Option<T> {
        let mut state = self.state.write().await;

        if state.invalidated_after(key, &ticket) {
            return None;
        }

        let value = state.entries.get_mut(key).map(|entry| {
            entry.mark_validated(ticket);
            entry.value.clone()
        });
        if value.is_some() {
            state.stats.count(CacheEvent::NotModified);
        }
        value
    }

    /// Drop the entry for `key` after a `404`, unless it was written by a newer request
    pub async fn discard_if_older(&self, key: &str, ticket: RequestTicket) -> bool {
        let mut state = self.state.write().await;

        let older = state
            .entries
            .get(key)
            .map(|entry| !entry.is_newer_than(&ticket))
            .unwrap_or(false);
        if older {
            state.entries.remove(key);
            state.stats.evictions += 1;
            debug!("Dropped cached value for {} after 404", key);
        }
        older
    }

    /// Remove an entry whose keep window has passed.
    ///
    /// Responses to requests sent before the eviction are not cached.
    pub async fn evict(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = self.tick();
        let mut state = self.state.write().await;

        state.invalidated_at.insert(key.to_string(), now);
        let removed = state.entries.remove(key);
        if removed.is_some() {
            state.stats.evictions += 1;
            debug!("Evicted expired cache entry: {}", key);
        }
        removed
    }

    /// Invalidate `key`: drop value and ETag, and reject responses to requests sent before now
    pub async fn remove(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = self.tick();
        let mut state = self.state.write().await;

        state.invalidated_at.insert(key.to_string(), now);
        let removed = state.entries.remove(key);
        if removed.is_some() {
            state.stats.invalidations += 1;
            debug!("Invalidated cache entry: {}", key);
        }
        removed
    }

    /// Invalidate every entry carrying `tag`, returning how many were removed
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let now = self.tick();
        let mut state = self.state.write().await;

        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.has_tag(tag))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            state.entries.remove(key);
            state.invalidated_at.insert(key.clone(), now);
        }
        state.stats.invalidations += keys.len() as u64;

        if !keys.is_empty() {
            info!("Invalidated {} cache entries tagged {}", keys.len(), tag);
        }
        keys.len()
    }

    /// Drop every entry and ETag
    pub async fn clear(&self) {
        let now = self.tick();
        let mut state = self.state.write().await;

        let count = state.entries.len();
        state.entries.clear();
        state.invalidated_at.clear();
        state.cleared_at = now;
        state.stats.invalidations += count as u64;

        info!("Cleared {} entries from cache", count);
    }

    pub async fn record(&self, event: CacheEvent) {
        self.state.write().await.stats.count(event);
    }

    /// Snapshot of counters plus current entry and ETag counts
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let mut stats = state.stats.clone();
        stats.entries = state.entries.len();
        stats.etags = state
            .entries
            .values()
            .filter(|entry| entry.etag.is_some())
            .count();
        stats
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn keys(&self) -> Vec<CacheKey> {
        let state = self.state.read().await;
        let mut keys: Vec<CacheKey> = state.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn etag(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = CacheStore::new();
        let ticket = store.issue_ticket();

        assert!(store.put("k", "v1".to_string(), etag("\"e1\""), ticket, &[]).await);

        let entry = store.get("k").await.unwrap();
        assert_eq!(entry.value, "v1");
        assert_eq!(store.etag("k").await, etag("\"e1\""));
        assert!(store.contains_key("k").await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_older_response_does_not_overwrite_newer() {
        let store = CacheStore::new();
        let slow = store.issue_ticket();
        let fast = store.issue_ticket();

        assert!(store.put("k", "new".to_string(), etag("\"e2\""), fast, &[]).await);
        assert!(!store.put("k", "old".to_string(), etag("\"e1\""), slow, &[]).await);

        let entry = store.get("k").await.unwrap();
        assert_eq!(entry.value, "new");
        assert_eq!(entry.etag, etag("\"e2\""));
    }

    #[tokio::test]
    async fn test_response_sent_before_invalidation_is_discarded() {
        let store = CacheStore::new();
        let before = store.issue_ticket();
        store.remove("k").await;
        let after = store.issue_ticket();

        assert!(!store.put("k", 1, None, before, &[]).await);
        assert!(store.get("k").await.is_none());
        assert!(store.put("k", 2, None, after, &[]).await);
    }

    #[tokio::test]
    async fn test_clear_rejects_in_flight_writes() {
        let store = CacheStore::new();
        let first = store.issue_ticket();
        store.put("a", 1, etag("\"a\""), first, &[]).await;
        let in_flight = store.issue_ticket();

        store.clear().await;

        assert!(store.is_empty().await);
        assert!(!store.put("b", 2, None, in_flight, &[]).await);
        assert_eq!(store.stats().await.invalidations, 1);
    }

    #[tokio::test]
    async fn test_mark_not_modified_keeps_value_and_etag() {
        let store = CacheStore::new();
        let ticket = store.issue_ticket();
        store.put("k", "v".to_string(), etag("\"e1\""), ticket, &[]).await;
        let fetched_at = store.get("k").await.unwrap().metadata.fetched_at;

        let value = store.mark_not_modified("k", store.issue_ticket()).await;

        assert_eq!(value.as_deref(), Some("v"));
        let entry = store.get("k").await.unwrap();
        assert_eq!(entry.metadata.fetched_at, fetched_at);
        assert_eq!(entry.etag, etag("\"e1\""));
        assert_eq!(entry.metadata.revalidations, 1);
        assert_eq!(store.stats().await.not_modified, 1);
    }

    #[tokio::test]
    async fn test_mark_not_modified_without_entry() {
        let store: CacheStore<String> = CacheStore::new();
        assert!(store.mark_not_modified("k", store.issue_ticket()).await.is_none());
        assert_eq!(store.stats().await.not_modified, 0);
    }

    #[tokio::test]
    async fn test_invalidated_since_tracks_remove_and_evict() {
        let store = CacheStore::new();
        store.put("k", 1, etag("\"e1\""), store.issue_ticket(), &[]).await;
        let revalidation = store.issue_ticket();
        assert!(!store.invalidated_since("k", &revalidation).await);

        store.evict("k").await;
        assert!(store.invalidated_since("k", &revalidation).await);
        assert!(store.mark_not_modified("k", revalidation).await.is_none());

        let refetch = store.issue_ticket();
        assert!(!store.invalidated_since("k", &refetch).await);
        store.remove("k").await;
        assert!(store.invalidated_since("k", &refetch).await);
        assert!(!store.invalidated_since("other", &refetch).await);
    }

    #[tokio::test]
    async fn test_discard_if_older() {
        let store = CacheStore::new();
        let request_404 = store.issue_ticket();
        let later = store.issue_ticket();
        store.put("k", 1, None, later, &[]).await;

        assert!(!store.discard_if_older("k", request_404).await);
        assert!(store.contains_key("k").await);

        assert!(store.discard_if_older("k", store.issue_ticket()).await);
        assert!(!store.contains_key("k").await);
        assert_eq!(store.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let store = CacheStore::new();
        let tag = vec!["key:ui.theme".to_string()];
        store.put("direct", 1, None, store.issue_ticket(), &tag).await;
        store.put("resolved", 2, None, store.issue_ticket(), &tag).await;
        store.put("other", 3, None, store.issue_ticket(), &[]).await;

        assert_eq!(store.invalidate_by_tag("key:ui.theme").await, 2);
        assert_eq!(store.keys().await, vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn test_stats_counts_entries_and_etags() {
        let store = CacheStore::new();
        store.put("a", 1, etag("\"a\""), store.issue_ticket(), &[]).await;
        store.put("b", 2, None, store.issue_ticket(), &[]).await;
        store.record(CacheEvent::Hit).await;
        store.record(CacheEvent::Miss).await;
        store.record(CacheEvent::StaleServed).await;
        store.evict("b").await;

        let stats = store.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.etags, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stale_served, 1);
        assert_eq!(stats.evictions, 1);
    }
}
