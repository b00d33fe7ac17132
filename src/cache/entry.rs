//! Cache entries with validation timestamps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifies the request that produced (or revalidated) a cache entry.
///
/// `sequence` is a per-store logical clock; it orders requests even when
/// their wall-clock `issued_at` values collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTicket {
    pub sequence: u64,
    pub issued_at: DateTime<Utc>,
}

/// A cached value together with its validator and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached value
    pub value: T,

    /// ETag returned with the value, if the server sent one
    pub etag: Option<String>,

    /// Entry metadata
    pub metadata: CacheMetadata,
}

impl<T> CacheEntry<T> {
    /// Create an entry for a value that just arrived with a `200`
    pub fn new(value: T, etag: Option<String>, ticket: RequestTicket) -> Self {
        let now = Utc::now();

        Self {
            value,
            etag,
            metadata: CacheMetadata {
                fetched_at: now,
                validated_at: now,
                issued_at: ticket.issued_at,
                sequence: ticket.sequence,
                revalidations: 0,
                tags: Vec::new(),
            },
        }
    }

    /// Record a `304` for this entry; value, etag and `fetched_at` are kept
    pub fn mark_validated(&mut self, ticket: RequestTicket) {
        self.metadata.validated_at = Utc::now();
        self.metadata.revalidations += 1;
        if ticket.sequence > self.metadata.sequence {
            self.metadata.sequence = ticket.sequence;
            self.metadata.issued_at = ticket.issued_at;
        }
    }

    /// Time since the server last confirmed this value
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.metadata.validated_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// Whether a response to `ticket` was issued before this entry's producer
    pub fn is_newer_than(&self, ticket: &RequestTicket) -> bool {
        self.metadata.sequence > ticket.sequence
    }

    /// Add a tag to the entry for selective invalidation
    pub fn add_tag(&mut self, tag: String) {
        if !self.metadata.tags.contains(&tag) {
            self.metadata.tags.push(tag);
        }
    }

    /// Check if entry has a specific tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.iter().any(|t| t == tag)
    }
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the `200` carrying the value arrived
    pub fetched_at: DateTime<Utc>,

    /// When the server last confirmed the value (`200` or `304`)
    pub validated_at: DateTime<Utc>,

    /// When the producing request was sent
    pub issued_at: DateTime<Utc>,

    /// Logical clock of the producing request
    pub sequence: u64,

    /// Number of `304` confirmations since the value was fetched
    pub revalidations: u64,

    /// Tags for categorization and selective invalidation
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn ticket(sequence: u64) -> RequestTicket {
        RequestTicket {
            sequence,
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn test_cache_entry_creation() {
        let entry = CacheEntry::new("v".to_string(), Some("\"e1\"".to_string()), ticket(3));

        assert_eq!(entry.value, "v");
        assert_eq!(entry.etag.as_deref(), Some("\"e1\""));
        assert_eq!(entry.metadata.fetched_at, entry.metadata.validated_at);
        assert_eq!(entry.metadata.sequence, 3);
        assert_eq!(entry.metadata.revalidations, 0);
    }

    #[test]
    fn test_mark_validated_keeps_fetch_time() {
        let mut entry = CacheEntry::new(1u32, Some("\"e1\"".to_string()), ticket(1));
        let fetched_at = entry.metadata.fetched_at - ChronoDuration::seconds(30);
        entry.metadata.fetched_at = fetched_at;
        entry.metadata.validated_at = fetched_at;

        entry.mark_validated(ticket(2));

        assert_eq!(entry.metadata.fetched_at, fetched_at);
        assert!(entry.metadata.validated_at > fetched_at);
        assert_eq!(entry.metadata.sequence, 2);
        assert_eq!(entry.metadata.revalidations, 1);
        assert_eq!(entry.etag.as_deref(), Some("\"e1\""));
    }

    #[test]
    fn test_age_measured_from_validation() {
        let mut entry = CacheEntry::new((), None, ticket(1));
        let now = Utc::now();
        entry.metadata.validated_at = now - ChronoDuration::seconds(90);

        assert_eq!(entry.age_at(now), Duration::from_secs(90));
        assert_eq!(
            entry.age_at(now - ChronoDuration::seconds(120)),
            Duration::from_secs(0)
        );
    }

    #[test]
    fn test_ordering_and_tags() {
        let mut entry = CacheEntry::new((), None, ticket(5));
        assert!(entry.is_newer_than(&ticket(4)));
        assert!(!entry.is_newer_than(&ticket(5)));

        entry.add_tag("key:ui.theme".to_string());
        entry.add_tag("key:ui.theme".to_string());
        assert_eq!(entry.metadata.tags.len(), 1);
        assert!(entry.has_tag("key:ui.theme"));
        assert!(!entry.has_tag("key:tax.config"));
    }
}
