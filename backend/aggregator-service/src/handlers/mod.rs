/// HTTP handlers for the aggregator
///
/// - Events: publish batches, list processed events
/// - Stats: counters, liveness, Prometheus metrics
pub mod events;
pub mod stats;

use actix_web::{error, web};

use crate::error::AppError;

pub use events::{list_events, publish};
pub use stats::{health, metrics, root, stats};

/// Register every route and the extractor error handlers.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(16 * 1024 * 1024)
            .error_handler(|err, _req| match err {
                error::JsonPayloadError::Deserialize(e) => {
                    AppError::Validation(e.to_string()).into()
                }
                other => AppError::BadRequest(other.to_string()).into(),
            }),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into()),
    )
    .route("/", web::get().to(root))
    .route("/health", web::get().to(health))
    .route("/publish", web::post().to(publish))
    .route("/events", web::get().to(list_events))
    .route("/stats", web::get().to(stats))
    .route("/metrics", web::get().to(metrics));
}
