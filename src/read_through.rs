//! Read-through facade with an explicit freshness policy.
//!
//! Callers state how old a value they accept by passing a
//! [`FreshnessPolicy`]; the facade decides between answering from cache,
//! revalidating, or fetching from scratch. Reactive bindings (watch
//! channels, UI hooks) belong in thin adapters on top of this type.

use crate::cache::{CacheEvent, CacheStats, CacheStore, Freshness, FreshnessPolicy};
use crate::error::Result;
use crate::fetch::ConditionalFetcher;
use crate::transport::HttpRequest;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub struct ReadThroughCache<T> {
    fetcher: ConditionalFetcher<T>,
}

impl<T> Clone for ReadThroughCache<T> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
        }
    }
}

impl<T> ReadThroughCache<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(fetcher: ConditionalFetcher<T>) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &ConditionalFetcher<T> {
        &self.fetcher
    }

    pub fn store(&self) -> &CacheStore<T> {
        self.fetcher.store()
    }

    /// Read `key`, consulting the network only as far as `policy` requires
    pub async fn read(
        &self,
        key: &str,
        request: HttpRequest,
        policy: &FreshnessPolicy,
    ) -> Result<Option<T>> {
        self.read_tagged(key, request, Vec::new(), policy).await
    }

    pub async fn read_tagged(
        &self,
        key: &str,
        request: HttpRequest,
        tags: Vec<String>,
        policy: &FreshnessPolicy,
    ) -> Result<Option<T>> {
        let Some(entry) = self.store().get(key).await else {
            return self.fetcher.fetch_tagged(key, request, tags).await;
        };

        match policy.classify(&entry, Utc::now()) {
            Freshness::Fresh => {
                debug!("Fresh cache hit: {}", key);
                self.store().record(CacheEvent::Hit).await;
                Ok(Some(entry.value))
            }
            Freshness::Stale if policy.background_revalidation => {
                debug!("Serving stale {} while revalidating", key);
                self.store().record(CacheEvent::Revalidation).await;
                if self.spawn_revalidation(key, request.clone(), tags.clone()) {
                    return Ok(Some(entry.value));
                }
                match self.fetcher.fetch_tagged(key, request, tags).await {
                    Ok(Some(value)) => Ok(Some(value)),
                    Ok(None) => Ok(None),
                    Err(e) => {
                        warn!("Revalidation of {} failed: {}", key, e);
                        Ok(Some(entry.value))
                    }
                }
            }
            Freshness::Stale => self.fetcher.fetch_tagged(key, request, tags).await,
            Freshness::Expired => {
                debug!("Cache entry for {} outlived its keep window", key);
                self.store().evict(key).await;
                self.fetcher.fetch_tagged(key, request, tags).await
            }
        }
    }

    /// Revalidate on the current tokio runtime; `false` when there is none
    fn spawn_revalidation(&self, key: &str, request: HttpRequest, tags: Vec<String>) -> bool {
        let Ok(handle) = Handle::try_current() else {
            debug!("No tokio runtime, revalidating {} inline", key);
            return false;
        };

        let fetcher = self.fetcher.clone();
        let key = key.to_string();
        handle.spawn(async move {
            match fetcher.fetch_tagged(&key, request, tags).await {
                Ok(_) => debug!("Background revalidation of {} finished", key),
                Err(e) => warn!("Background revalidation of {} failed: {}", key, e),
            }
        });
        true
    }

    /// Drop the value and ETag for `key`; the next read is unconditional
    pub async fn invalidate(&self, key: &str) -> bool {
        self.store().remove(key).await.is_some()
    }

    /// Drop every value and ETag
    pub async fn invalidate_all(&self) {
        self.store().clear().await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.store().stats().await
    }
}
