//! Bounded event buffer
//!
//! Fixed-capacity FIFO between the acceptance path and the consumer worker.
//! Producers never wait: a full buffer rejects immediately so the caller can
//! report backpressure. Every dequeued event comes wrapped in an
//! [`InFlightEvent`] lease; the in-flight count only drops when that lease is
//! completed (or dropped), so depth accounting cannot drift from consumption.
//!
//! Admission (`enqueue`, `reserve_batch`) and `close` are serialised by one
//! lock. Once `close` returns nothing new gets in, while a batch reserved
//! before the close is still delivered when committed. `dequeue` only reports
//! the end of the stream when the buffer is closed and no slot is occupied or
//! reserved.

use dedup_store::Event;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::mpsc::{self, Permit};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Default number of events the buffer holds
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Rejection returned by the non-blocking enqueue operations.
///
/// The rejected value is handed back to the caller.
#[derive(Debug)]
pub enum EnqueueError<T> {
    /// The buffer is at capacity
    QueueFull(T),
    /// The buffer was closed and accepts nothing new
    Closed(T),
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::QueueFull(_) => write!(f, "event buffer is full"),
            EnqueueError::Closed(_) => write!(f, "event buffer is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EnqueueError<T> {}

/// Counts events that were admitted (reserved or enqueued) but whose
/// processing is not yet settled.
#[derive(Debug, Default)]
struct CompletionTracker {
    in_flight: AtomicUsize,
    drained: Notify,
    /// Signalled when an uncommitted reservation gives its slots back
    released: Notify,
}

impl CompletionTracker {
    fn begin(&self, n: usize) {
        self.in_flight.fetch_add(n, Ordering::AcqRel);
    }

    fn finish(&self, n: usize) {
        let previous = self.in_flight.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(previous >= n, "in-flight count underflow");
        if previous == n {
            self.drained.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Capacity-bounded multi-producer / single-consumer event queue
pub struct EventBuffer {
    sender: mpsc::Sender<Event>,
    receiver: Mutex<mpsc::Receiver<Event>>,
    capacity: usize,
    tracker: Arc<CompletionTracker>,
    closed: watch::Sender<bool>,
    admission: StdMutex<()>,
}

impl EventBuffer {
    /// Create a buffer holding at most `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event buffer capacity must be greater than zero");

        let (sender, receiver) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);

        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
            tracker: Arc::new(CompletionTracker::default()),
            closed,
            admission: StdMutex::new(()),
        }
    }

    fn admission(&self) -> MutexGuard<'_, ()> {
        // The guarded section never panics midway, so a poisoned lock is still usable.
        self.admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add one event without waiting.
    pub fn enqueue(&self, event: Event) -> Result<(), EnqueueError<Event>> {
        let _admission = self.admission();
        if self.is_closed() {
            return Err(EnqueueError::Closed(event));
        }

        // Counted before the send so the consumer can never settle an event
        // the tracker has not seen yet.
        self.tracker.begin(1);
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.tracker.finish(1);
                Err(EnqueueError::QueueFull(event))
            }
            Err(TrySendError::Closed(event)) => {
                self.tracker.finish(1);
                Err(EnqueueError::Closed(event))
            }
        }
    }

    /// Reserve a slot for every event of a batch, all or nothing.
    ///
    /// The batch counts as in flight from here on, but nothing becomes visible
    /// to the consumer until [`PendingBatch::commit`]. Dropping the returned
    /// batch releases the slots.
    pub fn reserve_batch(
        &self,
        events: Vec<Event>,
    ) -> Result<PendingBatch<'_>, EnqueueError<Vec<Event>>> {
        let _admission = self.admission();
        if self.is_closed() {
            return Err(EnqueueError::Closed(events));
        }

        let mut permits = Vec::with_capacity(events.len());
        for _ in 0..events.len() {
            match self.sender.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(TrySendError::Full(())) => {
                    debug!(
                        requested = events.len(),
                        reserved = permits.len(),
                        "Not enough room for batch"
                    );
                    return Err(EnqueueError::QueueFull(events));
                }
                Err(TrySendError::Closed(())) => return Err(EnqueueError::Closed(events)),
            }
        }

        self.tracker.begin(events.len());
        Ok(PendingBatch {
            tracker: &self.tracker,
            permits,
            events,
            committed: false,
        })
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the buffer is closed and every event admitted
    /// before the close, including reserved batches, has been handed out or
    /// released.
    pub async fn dequeue(&self) -> Option<InFlightEvent> {
        let mut receiver = self.receiver.lock().await;
        let mut closed = self.closed.subscribe();

        loop {
            // Registered before the depth check so a release in between is not missed.
            let released = self.tracker.released.notified();

            match receiver.try_recv() {
                Ok(event) => return Some(self.lease(event)),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }

            let is_closed = *closed.borrow_and_update();
            if is_closed && self.depth() == 0 {
                return None;
            }

            tokio::select! {
                event = receiver.recv() => return event.map(|event| self.lease(event)),
                changed = closed.changed(), if !is_closed => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = released => {}
            }
        }
    }

    /// Stop accepting events and release a waiting `dequeue` once drained.
    pub fn close(&self) {
        let _admission = self.admission();
        if !self.closed.send_replace(true) {
            info!(
                depth = self.depth(),
                in_flight = self.in_flight(),
                "Event buffer closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Occupied slots, including slots reserved by an uncommitted batch
    pub fn depth(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events admitted but not yet completed by the consumer
    pub fn in_flight(&self) -> usize {
        self.tracker.count()
    }

    /// Suspend until every admitted event has been completed or released.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.tracker.drained.notified();
            if self.tracker.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lease(&self, event: Event) -> InFlightEvent {
        InFlightEvent {
            event,
            tracker: self.tracker.clone(),
            settled: false,
        }
    }
}

/// Slots reserved for a whole batch by [`EventBuffer::reserve_batch`]
pub struct PendingBatch<'a> {
    tracker: &'a Arc<CompletionTracker>,
    permits: Vec<Permit<'a, Event>>,
    events: Vec<Event>,
    committed: bool,
}

impl PendingBatch<'_> {
    /// Publish every event of the batch to the consumer, in order.
    pub fn commit(mut self) -> usize {
        self.committed = true;
        let permits = std::mem::take(&mut self.permits);
        let events = std::mem::take(&mut self.events);
        let count = events.len();

        for (permit, event) in permits.into_iter().zip(events) {
            permit.send(event);
        }

        count
    }
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        // Slots go back before anyone waiting on them is woken.
        self.permits.clear();
        self.tracker.finish(self.events.len());
        self.tracker.released.notify_waiters();
    }
}

/// A dequeued event whose completion has not been recorded yet.
///
/// Completion is recorded exactly once: by [`InFlightEvent::complete`], or on
/// drop if the holder never got that far.
pub struct InFlightEvent {
    event: Event,
    tracker: Arc<CompletionTracker>,
    settled: bool,
}

impl InFlightEvent {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Mark the event as fully handled.
    pub fn complete(mut self) {
        self.settle();
    }

    fn settle(&mut self) {
        if !self.settled {
            self.settled = true;
            self.tracker.finish(1);
        }
    }
}

impl Drop for InFlightEvent {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                event_id = %self.event.event_id,
                topic = %self.event.topic,
                "In-flight event dropped without completion, settling it"
            );
            self.settle();
        }
    }
}

impl fmt::Debug for InFlightEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightEvent")
            .field("event_id", &self.event.event_id)
            .field("topic", &self.event.topic)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn event(event_id: &str) -> Event {
        Event {
            topic: "t".to_string(),
            event_id: event_id.to_string(),
            timestamp: Utc::now(),
            source: "unit-test".to_string(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_enqueue_rejects_when_full() {
        let buffer = EventBuffer::new(3);
        for i in 0..3 {
            buffer.enqueue(event(&i.to_string())).unwrap();
        }

        match buffer.enqueue(event("overflow")) {
            Err(EnqueueError::QueueFull(rejected)) => assert_eq!(rejected.event_id, "overflow"),
            other => panic!("expected QueueFull, got {:?}", other),
        }
        assert_eq!(buffer.depth(), 3);
        assert_eq!(buffer.in_flight(), 3);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let buffer = EventBuffer::new(10);
        for id in ["a", "b", "c"] {
            buffer.enqueue(event(id)).unwrap();
        }

        for expected in ["a", "b", "c"] {
            let lease = buffer.dequeue().await.unwrap();
            assert_eq!(lease.event().event_id, expected);
            lease.complete();
        }
        assert_eq!(buffer.in_flight(), 0);
        assert_eq!(buffer.depth(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_drops_only_on_completion() {
        let buffer = EventBuffer::new(4);
        buffer.enqueue(event("1")).unwrap();

        let lease = buffer.dequeue().await.unwrap();
        assert_eq!(buffer.depth(), 0);
        assert_eq!(buffer.in_flight(), 1);

        lease.complete();
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_settled_once() {
        let buffer = EventBuffer::new(4);
        buffer.enqueue(event("1")).unwrap();
        buffer.enqueue(event("2")).unwrap();

        drop(buffer.dequeue().await.unwrap());
        assert_eq!(buffer.in_flight(), 1);

        buffer.dequeue().await.unwrap().complete();
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_waiting_dequeue() {
        let buffer = Arc::new(EventBuffer::new(4));

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.dequeue().await.map(|lease| lease.complete()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("dequeue was not released by close")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_new_events_but_drains_old_ones() {
        let buffer = EventBuffer::new(4);
        buffer.enqueue(event("before-close")).unwrap();
        buffer.close();

        let err = buffer.enqueue(event("after-close")).unwrap_err();
        assert!(matches!(err, EnqueueError::Closed(_)));
        assert!(buffer.reserve_batch(vec![event("x")]).is_err());

        let lease = buffer.dequeue().await.unwrap();
        assert_eq!(lease.event().event_id, "before-close");
        lease.complete();

        assert!(buffer.dequeue().await.is_none());
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reserve_batch_is_all_or_nothing() {
        let buffer = EventBuffer::new(3);
        buffer.enqueue(event("existing")).unwrap();

        match buffer.reserve_batch(vec![event("1"), event("2"), event("3")]) {
            Err(EnqueueError::QueueFull(rejected)) => assert_eq!(rejected.len(), 3),
            Err(other) => panic!("expected QueueFull, got {}", other),
            Ok(_) => panic!("batch larger than free space must be rejected"),
        }

        // Nothing from the rejected batch leaked into the buffer
        assert_eq!(buffer.depth(), 1);
        assert_eq!(buffer.in_flight(), 1);

        let batch = buffer.reserve_batch(vec![event("1"), event("2")]).unwrap();
        assert_eq!(buffer.depth(), 3);
        assert_eq!(buffer.in_flight(), 3, "reserved events count as in flight");
        assert_eq!(batch.commit(), 2);
        assert_eq!(buffer.in_flight(), 3);

        let mut order = Vec::new();
        for _ in 0..3 {
            let lease = buffer.dequeue().await.unwrap();
            order.push(lease.event().event_id.clone());
            lease.complete();
        }
        assert_eq!(order, vec!["existing", "1", "2"]);
    }

    #[tokio::test]
    async fn test_dropped_reservation_releases_slots() {
        let buffer = EventBuffer::new(2);

        let batch = buffer.reserve_batch(vec![event("1"), event("2")]).unwrap();
        assert!(matches!(
            buffer.enqueue(event("3")),
            Err(EnqueueError::QueueFull(_))
        ));
        drop(batch);

        assert_eq!(buffer.depth(), 0);
        assert_eq!(buffer.in_flight(), 0);
        buffer.enqueue(event("3")).unwrap();
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let buffer = Arc::new(EventBuffer::new(8));
        for i in 0..5 {
            buffer.enqueue(event(&i.to_string())).unwrap();
        }

        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    buffer.dequeue().await.unwrap().complete();
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(1), buffer.wait_drained())
            .await
            .expect("buffer never drained");
        assert_eq!(buffer.in_flight(), 0);
        consumer.await.unwrap();

        // Already drained: returns immediately
        buffer.wait_drained().await;
    }

    #[tokio::test]
    async fn test_batch_reserved_before_close_is_still_delivered() {
        let buffer = Arc::new(EventBuffer::new(4));
        let batch = buffer.reserve_batch(vec![event("late")]).unwrap();
        buffer.close();

        // The reservation keeps the stream open
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer.dequeue().await.map(|lease| {
                    let id = lease.event().event_id.clone();
                    lease.complete();
                    id
                })
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(buffer.in_flight(), 1);

        assert_eq!(batch.commit(), 1);
        let delivered = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("committed batch was not delivered")
            .unwrap();
        assert_eq!(delivered.as_deref(), Some("late"));

        tokio::time::timeout(Duration::from_secs(1), buffer.wait_drained())
            .await
            .expect("late batch was never drained");
        assert!(buffer.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_batch_released_after_close_ends_stream() {
        let buffer = Arc::new(EventBuffer::new(4));
        let batch = buffer.reserve_batch(vec![event("1"), event("2")]).unwrap();
        buffer.close();

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.dequeue().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(batch);
        let ended = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("dequeue was not released by the dropped batch")
            .unwrap();
        assert!(ended);
        assert_eq!(buffer.in_flight(), 0);
        assert!(buffer.reserve_batch(vec![event("3")]).is_err());
    }
}
