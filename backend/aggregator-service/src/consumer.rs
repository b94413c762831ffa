//! Consumer worker
//!
//! A single long-lived task that takes events off the [`EventBuffer`] one at a
//! time and drives them through the [`EventStore`].
//!
//! ```text
//!           dequeue ok              lease completed
//! Waiting -------------> Processing ---------------> Waiting
//!    |
//!    +-- shutdown signal, or buffer closed and empty --> Stopped
//! ```
//!
//! The shutdown signal is only observed while Waiting. An event that has been
//! dequeued is always settled and completed before the loop looks at the signal
//! again, so the buffer's in-flight count cannot leak.

use dedup_store::{Event, EventStore, InsertOutcome};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{EventBuffer, InFlightEvent};
use crate::metrics::AggregatorMetrics;

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Blocked on `dequeue`
    Waiting,
    /// Running `try_insert` for a dequeued event
    Processing,
    /// Loop has exited
    Stopped,
}

/// How a single dequeued event ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    New,
    Duplicate,
    Failed,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::New => "new",
            ProcessOutcome::Duplicate => "duplicate",
            ProcessOutcome::Failed => "failed",
        }
    }
}

impl From<InsertOutcome> for ProcessOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::New => ProcessOutcome::New,
            InsertOutcome::Duplicate => ProcessOutcome::Duplicate,
        }
    }
}

pub struct EventConsumer {
    buffer: Arc<EventBuffer>,
    store: Arc<dyn EventStore>,
    metrics: Option<AggregatorMetrics>,
    state: watch::Sender<WorkerState>,
}

impl EventConsumer {
    pub fn new(buffer: Arc<EventBuffer>, store: Arc<dyn EventStore>) -> Self {
        let (state, _) = watch::channel(WorkerState::Waiting);
        Self {
            buffer,
            store,
            metrics: None,
            state,
        }
    }

    pub fn with_metrics(mut self, metrics: AggregatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run the worker on the tokio runtime and return a handle to stop it.
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.subscribe_state();
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });

        ConsumerHandle {
            shutdown: shutdown_tx,
            state,
            task,
        }
    }

    /// Worker loop. Returns when shutdown is signalled while idle, when the
    /// shutdown sender is dropped, or when the buffer is closed and empty.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Event consumer started");

        loop {
            self.state.send_replace(WorkerState::Waiting);

            let lease = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Event consumer shutting down");
                    break;
                }
                lease = self.buffer.dequeue() => match lease {
                    Some(lease) => lease,
                    None => {
                        info!("Event buffer closed and drained, consumer exiting");
                        break;
                    }
                },
            };

            self.state.send_replace(WorkerState::Processing);
            self.process(lease).await;
        }

        self.state.send_replace(WorkerState::Stopped);
        info!("Event consumer stopped");
    }

    /// Settle one event and record its completion exactly once.
    async fn process(&self, lease: InFlightEvent) -> ProcessOutcome {
        let outcome = match AssertUnwindSafe(self.handle(lease.event()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    event_id = %lease.event().event_id,
                    topic = %lease.event().topic,
                    "Event processing panicked, skipping event"
                );
                self.record_failure().await;
                ProcessOutcome::Failed
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(outcome.as_str());
            metrics.queue_depth.set(self.buffer.depth() as i64);
        }

        lease.complete();

        outcome
    }

    async fn handle(&self, event: &Event) -> ProcessOutcome {
        match self.store.try_insert(event).await {
            Ok(InsertOutcome::New) => {
                info!(
                    event_id = %event.event_id,
                    topic = %event.topic,
                    "Processed new event"
                );
                ProcessOutcome::New
            }
            Ok(InsertOutcome::Duplicate) => {
                warn!(
                    event_id = %event.event_id,
                    topic = %event.topic,
                    "Detected duplicate event"
                );
                ProcessOutcome::Duplicate
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    topic = %event.topic,
                    error = %e,
                    transient = e.is_transient(),
                    "Failed to process event, skipping"
                );
                self.record_failure().await;
                ProcessOutcome::Failed
            }
        }
    }

    async fn record_failure(&self) {
        if let Err(e) = self.store.record_failure().await {
            error!(error = %e, "Failed to count processing failure");
        }
    }
}

/// Handle to a spawned [`EventConsumer`]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Ask the worker to stop. An event being processed is finished first.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait for the worker task to exit.
    pub async fn shutdown(self) {
        self.signal_shutdown();
        if let Err(e) = self.task.await {
            error!(error = %e, "Event consumer task failed");
        } else {
            debug!("Event consumer joined");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use dedup_store::{Counters, ProcessedEvent, StoreError, StoreResult};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn event(event_id: &str) -> Event {
        Event {
            topic: "t".to_string(),
            event_id: event_id.to_string(),
            timestamp: Utc::now(),
            source: "unit-test".to_string(),
            payload: serde_json::json!({}),
        }
    }

    /// In-memory store: ids starting with "fail" error, "panic" panics,
    /// "block" waits until released.
    #[derive(Default)]
    struct ScriptedStore {
        seen: StdMutex<HashSet<(String, String)>>,
        unique: AtomicI64,
        duplicates: AtomicI64,
        failures: AtomicI64,
        release: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl EventStore for ScriptedStore {
        async fn try_insert(&self, event: &Event) -> StoreResult<InsertOutcome> {
            if event.event_id.starts_with("block") {
                self.entered.notify_one();
                self.release.notified().await;
            }
            if event.event_id.starts_with("fail") {
                return Err(StoreError::Other(anyhow::anyhow!("disk I/O error")));
            }
            if event.event_id.starts_with("panic") {
                panic!("store exploded");
            }

            let key = (event.event_id.clone(), event.topic.clone());
            if self.seen.lock().unwrap().insert(key) {
                self.unique.fetch_add(1, Ordering::SeqCst);
                Ok(InsertOutcome::New)
            } else {
                self.duplicates.fetch_add(1, Ordering::SeqCst);
                Ok(InsertOutcome::Duplicate)
            }
        }

        async fn record_failure(&self) -> StoreResult<()> {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add_received(&self, _count: u64) -> StoreResult<()> {
            Ok(())
        }

        async fn list_events(
            &self,
            _topic: Option<&str>,
            _limit: u32,
        ) -> StoreResult<Vec<ProcessedEvent>> {
            Ok(Vec::new())
        }

        async fn close(&self) {}

        async fn counters(&self) -> StoreResult<Counters> {
            Ok(Counters {
                unique_processed_total: self.unique.load(Ordering::SeqCst),
                duplicate_dropped_total: self.duplicates.load(Ordering::SeqCst),
                processing_failed_total: self.failures.load(Ordering::SeqCst),
                ..Counters::default()
            })
        }
    }

    async fn wait_for_state(handle: &ConsumerHandle, expected: WorkerState) {
        let mut state = handle.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == expected))
            .await
            .expect("worker never reached expected state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_every_outcome_completes_its_lease() {
        let buffer = Arc::new(EventBuffer::new(16));
        let store = Arc::new(ScriptedStore::default());

        for id in ["1", "2", "1", "fail-1", "panic-1", "3"] {
            buffer.enqueue(event(id)).unwrap();
        }

        let handle = EventConsumer::new(buffer.clone(), store.clone()).spawn();
        tokio::time::timeout(Duration::from_secs(2), buffer.wait_drained())
            .await
            .expect("in-flight count leaked");

        assert_eq!(buffer.in_flight(), 0);
        assert_eq!(store.unique.load(Ordering::SeqCst), 3);
        assert_eq!(store.duplicates.load(Ordering::SeqCst), 1);
        assert_eq!(store.failures.load(Ordering::SeqCst), 2);

        // Loop survived the failure and the panic
        assert!(!handle.is_finished());
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown after drain hung");
    }

    #[tokio::test]
    async fn test_shutdown_while_idle_stops_immediately() {
        let buffer = Arc::new(EventBuffer::new(4));
        let store = Arc::new(ScriptedStore::default());
        let handle = EventConsumer::new(buffer.clone(), store).spawn();

        wait_for_state(&handle, WorkerState::Waiting).await;
        let state = handle.subscribe_state();

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("idle worker did not stop");
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_processing_is_deferred() {
        let buffer = Arc::new(EventBuffer::new(4));
        let store = Arc::new(ScriptedStore::default());
        buffer.enqueue(event("block-1")).unwrap();
        buffer.enqueue(event("after")).unwrap();

        let handle = EventConsumer::new(buffer.clone(), store.clone()).spawn();
        store.entered.notified().await;
        assert_eq!(handle.state(), WorkerState::Processing);

        handle.signal_shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), WorkerState::Processing);
        assert!(!handle.is_finished());

        store.release.notify_one();
        wait_for_state(&handle, WorkerState::Stopped).await;

        // The blocked event was completed; the next one was never taken
        assert_eq!(store.unique.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.in_flight(), 1);
        assert_eq!(buffer.depth(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_buffer_ends_loop_after_drain() {
        let buffer = Arc::new(EventBuffer::new(4));
        let store = Arc::new(ScriptedStore::default());
        buffer.enqueue(event("1")).unwrap();
        buffer.enqueue(event("2")).unwrap();
        buffer.close();

        let handle = EventConsumer::new(buffer.clone(), store.clone()).spawn();
        wait_for_state(&handle, WorkerState::Stopped).await;

        assert_eq!(store.unique.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.in_flight(), 0);
        handle.shutdown().await;
    }
}
