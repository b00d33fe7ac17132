//! Conditional fetcher
//!
//! Issues `GET` requests carrying `If-None-Match` when an ETag is cached and
//! turns the server's answer into a value:
//!
//! | Response | Result | Cache |
//! |---|---|---|
//! | `200` | parsed body | stored with the response `ETag` |
//! | `304` | cached value | `validated_at` refreshed |
//! | `404` | `None` | never stored |
//! | transport failure | cached value if any, else error | untouched |
//! | anything else | [`ClientError::UnexpectedStatus`] | untouched |
//!
//! Concurrent fetches of one key share a single round trip. Dropping every
//! caller's future aborts the request before anything is cached. A fetch
//! never joins a round trip that was sent before its key was invalidated or
//! evicted, and a `304` that arrives for such a key is followed by one
//! unconditional `GET`.

use crate::cache::{CacheEvent, CacheKey, CacheStore, RequestTicket};
use crate::error::{ClientError, Result};
use crate::transport::{HttpRequest, HttpTransport};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use reqwest::header::IF_NONE_MATCH;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Option<T>>>>;
type WeakFetch<T> = WeakShared<BoxFuture<'static, Result<Option<T>>>>;

/// A round trip other callers may join
struct InFlight<T> {
    fetch: WeakFetch<T>,
    ticket: RequestTicket,
}

/// Result of one request/response exchange
enum Exchange<T> {
    Complete(Option<T>),

    /// `304` for a validator the cache no longer holds
    ValidatorDropped,
}

/// Single-flight conditional `GET` over a [`CacheStore`]
pub struct ConditionalFetcher<T> {
    transport: Arc<dyn HttpTransport>,
    store: CacheStore<T>,
    in_flight: Arc<Mutex<HashMap<CacheKey, InFlight<T>>>>,
}

impl<T> Clone for ConditionalFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            store: self.store.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<T> ConditionalFetcher<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_store(transport, CacheStore::new())
    }

    pub fn with_store(transport: Arc<dyn HttpTransport>, store: CacheStore<T>) -> Self {
        Self {
            transport,
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &CacheStore<T> {
        &self.store
    }

    /// Fetch `key` with `request`, revalidating any cached ETag
    pub async fn fetch(&self, key: &str, request: HttpRequest) -> Result<Option<T>> {
        self.fetch_tagged(key, request, Vec::new()).await
    }

    /// Like [`fetch`](Self::fetch); a `200` is stored with `tags` attached
    pub async fn fetch_tagged(
        &self,
        key: &str,
        request: HttpRequest,
        tags: Vec<String>,
    ) -> Result<Option<T>> {
        let (mut shared, ticket) = self.join_or_start(key, &request, &tags);
        if self.store.invalidated_since(key, &ticket).await {
            debug!("Not joining request for {} sent before it was invalidated", key);
            shared = self.restart(key, &shared, request, tags);
        }

        let result = shared.clone().await;
        self.forget(key, &shared);
        result
    }

    /// Number of round trips currently in flight
    pub fn in_flight_count(&self) -> usize {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight
            .values()
            .filter(|entry| entry.fetch.upgrade().is_some())
            .count()
    }

    fn join_or_start(
        &self,
        key: &str,
        request: &HttpRequest,
        tags: &[String],
    ) -> (SharedFetch<T>, RequestTicket) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // Round trips whose callers were all cancelled
        in_flight.retain(|_, entry| entry.fetch.upgrade().is_some());

        if let Some(entry) = in_flight.get(key) {
            if let Some(existing) = entry.fetch.upgrade() {
                debug!("Joining in-flight request for {}", key);
                return (existing, entry.ticket);
            }
        }

        self.start(&mut in_flight, key, request.clone(), tags.to_vec())
    }

    /// Replace `superseded` with a new round trip unless another caller already did
    fn restart(
        &self,
        key: &str,
        superseded: &SharedFetch<T>,
        request: HttpRequest,
        tags: Vec<String>,
    ) -> SharedFetch<T> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = in_flight.get(key).and_then(|entry| entry.fetch.upgrade()) {
            if !Shared::ptr_eq(&current, superseded) {
                return current;
            }
        }
        self.start(&mut in_flight, key, request, tags).0
    }

    fn start(
        &self,
        in_flight: &mut HashMap<CacheKey, InFlight<T>>,
        key: &str,
        request: HttpRequest,
        tags: Vec<String>,
    ) -> (SharedFetch<T>, RequestTicket) {
        let ticket = self.store.issue_ticket();
        let shared = self
            .clone()
            .round_trip(key.to_string(), request, tags, ticket)
            .boxed()
            .shared();
        if let Some(fetch) = shared.downgrade() {
            in_flight.insert(key.to_string(), InFlight { fetch, ticket });
        }
        (shared, ticket)
    }

    fn forget(&self, key: &str, shared: &SharedFetch<T>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = match in_flight.get(key).and_then(|entry| entry.fetch.upgrade()) {
            Some(current) => Shared::ptr_eq(&current, shared),
            None => true,
        };
        if finished {
            in_flight.remove(key);
        }
    }

    async fn round_trip(
        self,
        key: CacheKey,
        request: HttpRequest,
        tags: Vec<String>,
        ticket: RequestTicket,
    ) -> Result<Option<T>> {
        match self
            .exchange(&key, request.clone(), &tags, ticket, true)
            .await?
        {
            Exchange::Complete(value) => Ok(value),
            Exchange::ValidatorDropped => {
                debug!("{} was invalidated during revalidation, fetching without If-None-Match", key);
                let ticket = self.store.issue_ticket();
                match self.exchange(&key, request, &tags, ticket, false).await? {
                    Exchange::Complete(value) => Ok(value),
                    Exchange::ValidatorDropped => Err(ClientError::CacheMiss(key)),
                }
            }
        }
    }

    async fn exchange(
        &self,
        key: &str,
        request: HttpRequest,
        tags: &[String],
        ticket: RequestTicket,
        conditional: bool,
    ) -> Result<Exchange<T>> {
        let context = request.describe();

        let etag = if conditional {
            self.store.etag(key).await
        } else {
            None
        };
        let request = match &etag {
            Some(etag) => request.header(IF_NONE_MATCH.as_str(), etag.clone()),
            None => {
                if conditional && !self.store.contains_key(key).await {
                    self.store.record(CacheEvent::Miss).await;
                }
                request
            }
        };
        debug!("{} (If-None-Match: {:?})", context, etag);

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(error) => return self.serve_stale(key, error).await.map(Exchange::Complete),
        };

        match response.status() {
            StatusCode::OK => match response.json::<T>() {
                Ok(value) => {
                    self.store
                        .put(key, value.clone(), response.etag(), ticket, tags)
                        .await;
                    Ok(Exchange::Complete(Some(value)))
                }
                Err(e) => {
                    let error =
                        ClientError::Transport(format!("unparseable body from {}: {}", context, e));
                    self.serve_stale(key, error).await.map(Exchange::Complete)
                }
            },
            StatusCode::NOT_MODIFIED => {
                debug!("304 Not Modified for {}", key);
                match self.store.mark_not_modified(key, ticket).await {
                    Some(value) => Ok(Exchange::Complete(Some(value))),
                    None if etag.is_some() => Ok(Exchange::ValidatorDropped),
                    None => Err(ClientError::CacheMiss(key.to_string())),
                }
            }
            StatusCode::NOT_FOUND => {
                debug!("404 Not Found for {}", key);
                self.store.discard_if_older(key, ticket).await;
                Ok(Exchange::Complete(None))
            }
            status => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                context,
            }),
        }
    }

    async fn serve_stale(&self, key: &str, error: ClientError) -> Result<Option<T>> {
        if !matches!(error, ClientError::Transport(_)) {
            return Err(error);
        }

        match self.store.get(key).await {
            Some(entry) => {
                warn!("Serving cached value for {} after fetch failure: {}", key, error);
                self.store.record(CacheEvent::StaleServed).await;
                Ok(Some(entry.value))
            }
            None => Err(error),
        }
    }
}
