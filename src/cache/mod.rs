//! # Conditional Response Cache
//!
//! Storage for values fetched with conditional HTTP requests.
//!
//! ## Features
//!
//! - **ETag Validators**: each entry keeps the ETag it arrived with, so the next
//!   request can be sent with `If-None-Match`
//! - **Stale-Overwrite Protection**: writes carry a request ticket and are
//!   discarded when a newer response or an invalidation already landed
//! - **Freshness Bands**: [`FreshnessPolicy`] classifies entries as fresh,
//!   stale or expired by the time since their last validation
//! - **Tag Invalidation**: entries can be dropped by tag, e.g. every cached
//!   lookup of one setting key after it was updated
//!
//! ## Example
//!
//! ```rust
//! use settings_client::cache::{CacheKeyBuilder, CacheStore, KeyKind};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store: CacheStore<String> = CacheStore::new();
//! let key = CacheKeyBuilder::new(KeyKind::Resolve)
//!     .identifier("tax.config")
//!     .param("territory", "CH")
//!     .build();
//!
//! let ticket = store.issue_ticket();
//! store.put(&key, "CHF".to_string(), Some("\"abc123\"".to_string()), ticket, &[]).await;
//!
//! if let Some(etag) = store.etag(&key).await {
//!     println!("Next request sends If-None-Match: {}", etag);
//! }
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod freshness;
pub mod key;
pub mod store;
pub mod types;

pub use entry::{CacheEntry, CacheMetadata, RequestTicket};
pub use freshness::{Freshness, FreshnessPolicy};
pub use key::{CacheKeyBuilder, KeyKind};
pub use store::CacheStore;
pub use types::{CacheEvent, CacheKey, CacheStats};
