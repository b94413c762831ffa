//! Statistics aggregator
//!
//! Read-only view combining the durable counters kept by the dedup store with
//! process-local facts (uptime, buffer occupancy).

use dedup_store::{EventStore, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::EventBuffer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: f64,
    pub received_total: i64,
    pub unique_processed_total: i64,
    pub duplicate_dropped_total: i64,
    pub processing_failed_total: i64,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub topics: BTreeMap<String, i64>,
}

#[derive(Clone)]
pub struct StatsService {
    store: Arc<dyn EventStore>,
    buffer: Arc<EventBuffer>,
    started_at: Instant,
}

impl StatsService {
    pub fn new(store: Arc<dyn EventStore>, buffer: Arc<EventBuffer>) -> Self {
        Self {
            store,
            buffer,
            started_at: Instant::now(),
        }
    }

    /// Current counters; durable values come from a single store snapshot.
    pub async fn snapshot(&self) -> StoreResult<StatsSnapshot> {
        let counters = self.store.counters().await?;

        Ok(StatsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            received_total: counters.received_total,
            unique_processed_total: counters.unique_processed_total,
            duplicate_dropped_total: counters.duplicate_dropped_total,
            processing_failed_total: counters.processing_failed_total,
            queue_depth: self.buffer.depth(),
            in_flight: self.buffer.in_flight(),
            topics: counters.topics,
        })
    }
}
