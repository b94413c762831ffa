/// Event handlers - acceptance path and processed event listing
use actix_web::{web, HttpResponse};
use dedup_store::{validate_event, Event, StoreError};
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::app::AppState;
use crate::buffer::EnqueueError;
use crate::error::{AppError, Result};
use crate::models::{EventResponse, EventsQuery, PublishRequest, PublishResponse};

/// Accept a batch of events for asynchronous processing.
///
/// The batch is validated as a whole and admitted to the buffer all or
/// nothing. Processing happens later on the consumer worker.
pub async fn publish(
    state: web::Data<AppState>,
    req: web::Json<PublishRequest>,
) -> Result<HttpResponse> {
    let req = req.into_inner();

    if req.events.is_empty() {
        return Err(AppError::BadRequest("No events provided".to_string()));
    }

    req.validate()?;

    let events: Vec<Event> = req.events.into_iter().map(Event::from).collect();
    for event in &events {
        validate_event(event).map_err(|e| match e {
            StoreError::InvalidEvent(msg) => AppError::Validation(msg),
            other => AppError::Storage(other),
        })?;
    }

    let count = events.len();
    let batch = match state.buffer.reserve_batch(events) {
        Ok(batch) => batch,
        Err(err) => {
            if let Some(metrics) = &state.metrics {
                metrics.rejected.inc_by(count as u64);
            }
            return Err(match err {
                EnqueueError::QueueFull(_) => {
                    warn!(
                        batch_size = count,
                        depth = state.buffer.depth(),
                        "Buffer full, batch rejected"
                    );
                    AppError::ServiceBusy("Service busy, queue is full".to_string())
                }
                EnqueueError::Closed(_) => {
                    warn!(batch_size = count, "Buffer closed, batch rejected");
                    AppError::ServiceBusy("Service is shutting down".to_string())
                }
            });
        }
    };

    // Counted before the events become visible, so the consumer can never
    // settle more events than were received. Dropping the batch on error
    // releases its slots.
    if let Err(e) = state.store.add_received(count as u64).await {
        error!(error = %e, batch_size = count, "Failed to record received events");
        return Err(AppError::Storage(e));
    }

    let queued = batch.commit();
    state.refresh_gauges();
    info!(queued, depth = state.buffer.depth(), "Batch accepted");

    Ok(HttpResponse::Ok().json(PublishResponse::queued(queued)))
}

/// List processed events, most recently processed first
pub async fn list_events(
    state: web::Data<AppState>,
    query: web::Query<EventsQuery>,
) -> Result<HttpResponse> {
    let limit = query.limit().map_err(AppError::BadRequest)?;
    let topic = query.topic();

    debug!(topic = ?topic, limit, "Listing processed events");

    let events = state.store.list_events(topic, limit).await?;
    let responses: Vec<EventResponse> = events.into_iter().map(EventResponse::from).collect();

    Ok(HttpResponse::Ok().json(responses))
}
