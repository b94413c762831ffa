//! Service wiring
//!
//! [`Aggregator`] owns the long-lived pieces (store, buffer, consumer task) and
//! [`AppState`] is the cloneable slice of them handed to HTTP handlers.

use anyhow::Context;
use dedup_store::{EventStore, SqliteEventStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::buffer::EventBuffer;
use crate::config::Config;
use crate::consumer::{ConsumerHandle, EventConsumer};
use crate::metrics::AggregatorMetrics;
use crate::services::StatsService;

/// Shared state for request handlers
#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<EventBuffer>,
    pub store: Arc<dyn EventStore>,
    pub stats: Arc<StatsService>,
    pub metrics: Option<AggregatorMetrics>,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        let buffer = Arc::new(EventBuffer::new(capacity));
        let stats = Arc::new(StatsService::new(store.clone(), buffer.clone()));

        Self {
            buffer,
            store,
            stats,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AggregatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build a consumer for this state's buffer and store.
    pub fn consumer(&self) -> EventConsumer {
        let consumer = EventConsumer::new(self.buffer.clone(), self.store.clone());
        match &self.metrics {
            Some(metrics) => consumer.with_metrics(metrics.clone()),
            None => consumer,
        }
    }

    /// Push current buffer occupancy into the queue depth gauge.
    pub fn refresh_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.queue_depth.set(self.buffer.depth() as i64);
        }
    }
}

/// Running aggregator: shared state plus its consumer worker
pub struct Aggregator {
    state: AppState,
    consumer: ConsumerHandle,
    drain_timeout: Duration,
}

impl Aggregator {
    /// Open the store, build the buffer and spawn the consumer worker.
    pub async fn start(
        config: &Config,
        metrics: Option<AggregatorMetrics>,
    ) -> anyhow::Result<Self> {
        info!(path = %config.database.path.display(), "Opening dedup store");
        let store = SqliteEventStore::open(&config.database.path, config.store_options())
            .await
            .context("Failed to open dedup store")?;

        let mut state = AppState::new(Arc::new(store), config.queue.capacity);
        if let Some(metrics) = metrics {
            state = state.with_metrics(metrics);
        }

        Ok(Self::from_parts(state, config.drain_timeout()))
    }

    /// Spawn a consumer for an already-built state.
    pub fn from_parts(state: AppState, drain_timeout: Duration) -> Self {
        let consumer = state.consumer().spawn();
        info!(capacity = state.buffer.capacity(), "Aggregator started");

        Self {
            state,
            consumer,
            drain_timeout,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting events, give the consumer a bounded window to finish
    /// what was already accepted, then stop the worker and close the store.
    pub async fn shutdown(self) {
        self.state.buffer.close();

        match tokio::time::timeout(self.drain_timeout, self.state.buffer.wait_drained()).await {
            Ok(()) => info!("All accepted events processed"),
            Err(_) => warn!(
                remaining = self.state.buffer.in_flight(),
                timeout_secs = self.drain_timeout.as_secs(),
                "Drain timed out, unprocessed events will be lost"
            ),
        }

        self.consumer.shutdown().await;
        self.state.store.close().await;
        info!("Aggregator stopped");
    }
}
