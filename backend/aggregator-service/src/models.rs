/// Request and response types for the HTTP API
use chrono::{DateTime, Utc};
use dedup_store::{Event, ProcessedEvent};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Default page size for `GET /events`
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Largest page size accepted by `GET /events`
pub const MAX_LIST_LIMIT: u32 = 1000;

/// Body of `POST /publish`
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PublishRequest {
    #[validate(nested)]
    pub events: Vec<PublishEvent>,
}

/// One event as it appears on the wire.
///
/// `timestamp` must be RFC 3339 and `payload` must be a JSON object; both are
/// enforced during deserialization.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PublishEvent {
    #[validate(length(min = 1, max = 255))]
    pub topic: String,

    #[validate(length(min = 1, max = 255))]
    pub event_id: String,

    pub timestamp: DateTime<Utc>,

    pub source: String,

    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl From<PublishEvent> for Event {
    fn from(event: PublishEvent) -> Self {
        Event {
            topic: event.topic,
            event_id: event.event_id,
            timestamp: event.timestamp,
            source: event.source,
            payload: serde_json::Value::Object(event.payload),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub message: String,
    pub queued: usize,
}

impl PublishResponse {
    pub fn queued(count: usize) -> Self {
        Self {
            message: format!("Queued {} events for processing.", count),
            queued: count,
        }
    }
}

/// Query string of `GET /events`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    pub topic: Option<String>,
    pub limit: Option<u32>,
}

impl EventsQuery {
    /// Topic filter, with an empty value meaning "all topics"
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref().filter(|topic| !topic.is_empty())
    }

    /// Requested page size, if it is within `1..=MAX_LIST_LIMIT`
    pub fn limit(&self) -> Result<u32, String> {
        match self.limit {
            None => Ok(DEFAULT_LIST_LIMIT),
            Some(limit) if (1..=MAX_LIST_LIMIT).contains(&limit) => Ok(limit),
            Some(limit) => Err(format!(
                "limit must be between 1 and {}, got {}",
                MAX_LIST_LIMIT, limit
            )),
        }
    }
}

/// Processed event as returned by `GET /events`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

impl From<ProcessedEvent> for EventResponse {
    fn from(event: ProcessedEvent) -> Self {
        Self {
            topic: event.topic,
            event_id: event.event_id,
            timestamp: event.timestamp,
            source: event.source,
            payload: event.payload,
            processed_at: event.processed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}
