//! # Dedup Store
//!
//! Persistent idempotency tracking for the event aggregator. Every event is
//! identified by its dedup key `(event_id, topic)`; the store guarantees that
//! at most one processed record exists per key, no matter how many times or
//! how concurrently the same event is submitted.
//!
//! ## Problem
//!
//! Producers deliver at-least-once:
//! - **Resends**: a producer that timed out retries the same batch
//! - **Restarts**: in-memory "seen" sets are lost, so events are reprocessed
//! - **Concurrency**: two connections can submit the same event at the same time
//!
//! ## Solution
//!
//! Use the storage engine's uniqueness constraint as the only duplicate check:
//! - **Failed unique insert = duplicate**: there is no "check, then insert" step,
//!   so two concurrent attempts on one key cannot both win
//! - **One transaction per new event**: dedup key, event body and the
//!   `unique_processed_total` counter are committed together
//! - **Durable counters**: statistics live next to the events they account for
//!   and survive restarts
//!
//! ## Architecture
//!
//! ```text
//! Consumer Worker → EventStore::try_insert
//!                        ↓
//!        INSERT dedup_keys (event_id, topic)  ── UNIQUE violation ──→ Duplicate
//!                        ↓                                  (duplicate_dropped_total += 1)
//!        INSERT OR IGNORE processed_events
//!        UPDATE statistics unique_processed_total += 1
//!                        ↓
//!                     COMMIT → New
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use dedup_store::{Event, EventStore, InsertOutcome, SqliteEventStore, StoreOptions};
//!
//! # async fn example(event: Event) -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteEventStore::open("aggregator.db", StoreOptions::default()).await?;
//!
//! match store.try_insert(&event).await? {
//!     InsertOutcome::New => println!("first time we see this event"),
//!     InsertOutcome::Duplicate => println!("already processed, dropped"),
//! }
//!
//! let counters = store.counters().await?;
//! println!("unique = {}", counters.unique_processed_total);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Safety
//!
//! - **10 tasks insert the same key**: exactly one gets `New`, the other nine get
//!   `Duplicate`; `duplicate_dropped_total` grows by nine
//! - **Several processes share one database file**: SQLite serialises writers
//!   with a file lock, so the primary key check is atomic across processes too
//! - **Readers**: WAL journal mode lets `list_events` and `counters` run next to
//!   writers and observe a committed snapshot

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod error;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use sqlite::{SqliteEventStore, StoreOptions};

/// Maximum length accepted for `event_id` and `topic`
pub const MAX_KEY_LEN: usize = 255;

/// A single event as submitted by a producer.
///
/// `payload` is opaque to the store: it is persisted and returned as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Logical stream name
    pub topic: String,

    /// Producer-assigned identifier, unique only together with `topic`
    pub event_id: String,

    /// Producer-supplied time, not checked against the wall clock
    pub timestamp: DateTime<Utc>,

    /// Free-form producer identifier
    pub source: String,

    /// Arbitrary key/value document
    pub payload: serde_json::Value,
}

impl Event {
    /// The `(event_id, topic)` pair used as the uniqueness boundary
    pub fn dedup_key(&self) -> DedupKey<'_> {
        DedupKey {
            event_id: &self.event_id,
            topic: &self.topic,
        }
    }
}

/// Borrowed view of an event's dedup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
    pub event_id: &'a str,
    pub topic: &'a str,
}

/// Durable record of an event that was processed for the first time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: serde_json::Value,

    /// Server-assigned time of first successful processing
    pub processed_at: DateTime<Utc>,
}

/// Result of `EventStore::try_insert`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this dedup key was seen; the event is now persisted
    New,

    /// The dedup key already existed; nothing but the duplicate counter changed
    Duplicate,
}

impl InsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::New)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InsertOutcome::New => "new",
            InsertOutcome::Duplicate => "duplicate",
        }
    }
}

/// Named counters kept in the `statistics` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Events accepted by the acceptance path
    Received,
    /// Events processed for the first time
    UniqueProcessed,
    /// Resubmissions dropped by the uniqueness constraint
    DuplicateDropped,
    /// Events skipped because storage failed while processing them
    ProcessingFailed,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Received => "received_total",
            Counter::UniqueProcessed => "unique_processed_total",
            Counter::DuplicateDropped => "duplicate_dropped_total",
            Counter::ProcessingFailed => "processing_failed_total",
        }
    }
}

/// Snapshot of all counters plus the per-topic count of processed events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub received_total: i64,
    pub unique_processed_total: i64,
    pub duplicate_dropped_total: i64,
    pub processing_failed_total: i64,

    /// Derived from a `GROUP BY topic` over processed events, not stored separately
    pub topics: BTreeMap<String, i64>,
}

impl Counters {
    /// Events whose processing outcome is known (new, duplicate or failed)
    pub fn settled_total(&self) -> i64 {
        self.unique_processed_total + self.duplicate_dropped_total + self.processing_failed_total
    }
}

/// Storage seam used by the consumer worker and the read surface.
///
/// Implementations must enforce dedup-key uniqueness inside the storage engine
/// itself; callers never take an application-level lock around these calls.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically record the event if its dedup key is new.
    ///
    /// # Errors
    ///
    /// Returns error for storage failures other than the uniqueness violation,
    /// which is reported as `Ok(InsertOutcome::Duplicate)`.
    async fn try_insert(&self, event: &Event) -> StoreResult<InsertOutcome>;

    /// Count an event that could not be processed because of a storage error.
    async fn record_failure(&self) -> StoreResult<()>;

    /// Add `count` accepted events to `received_total`.
    async fn add_received(&self, count: u64) -> StoreResult<()>;

    /// Processed events, most recently processed first, optionally for one topic.
    async fn list_events(&self, topic: Option<&str>, limit: u32)
        -> StoreResult<Vec<ProcessedEvent>>;

    /// Consistent snapshot of all counters.
    async fn counters(&self) -> StoreResult<Counters>;

    /// Release storage resources. Every later call fails with a storage error.
    async fn close(&self);
}

/// Validate the dedup key fields of an event
pub fn validate_event(event: &Event) -> StoreResult<()> {
    validate_key_part("event_id", &event.event_id)?;
    validate_key_part("topic", &event.topic)
}

fn validate_key_part(field: &str, value: &str) -> StoreResult<()> {
    if value.is_empty() {
        return Err(StoreError::InvalidEvent(format!("{} cannot be empty", field)));
    }

    if value.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidEvent(format!(
            "{} too long: {} characters (max {})",
            field,
            value.len(),
            MAX_KEY_LEN
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: &str, event_id: &str) -> Event {
        Event {
            topic: topic.to_string(),
            event_id: event_id.to_string(),
            timestamp: Utc::now(),
            source: "unit-test".to_string(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn test_validate_event() {
        // Valid
        assert!(validate_event(&event("t", "1")).is_ok());
        assert!(validate_event(&event("t", &"x".repeat(255))).is_ok());

        // Invalid: empty
        let err = validate_event(&event("t", "")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEvent(_)));
        let err = validate_event(&event("", "1")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEvent(_)));

        // Invalid: too long
        let err = validate_event(&event(&"t".repeat(256), "1")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEvent(_)));
    }

    #[test]
    fn test_dedup_key_combines_id_and_topic() {
        let a = event("orders", "42");
        let b = event("payments", "42");

        assert_ne!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), event("orders", "42").dedup_key());
    }

    #[test]
    fn test_settled_total() {
        let counters = Counters {
            received_total: 10,
            unique_processed_total: 6,
            duplicate_dropped_total: 3,
            processing_failed_total: 1,
            topics: BTreeMap::new(),
        };
        assert_eq!(counters.settled_total(), 10);
    }

    #[test]
    fn test_insert_outcome() {
        assert!(InsertOutcome::New.is_new());
        assert!(!InsertOutcome::Duplicate.is_new());
        assert_eq!(InsertOutcome::Duplicate.as_str(), "duplicate");
        assert_eq!(Counter::DuplicateDropped.as_str(), "duplicate_dropped_total");
    }
}
