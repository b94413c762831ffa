/// Aggregator Service - Main entry point
///
/// Serves the publish/query API and runs the consumer worker until the HTTP
/// server stops, then drains what was already accepted.
use actix_web::{middleware, web, App, HttpServer};
use aggregator_service::handlers;
use aggregator_service::metrics::AggregatorMetrics;
use aggregator_service::{Aggregator, Config};
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aggregator_service=info,dedup_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().map_err(|e| {
        tracing::error!("Invalid configuration: {:#}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;

    tracing::info!(
        host = %config.app.host,
        port = config.app.port,
        capacity = config.queue.capacity,
        "Starting aggregator-service"
    );

    let metrics = AggregatorMetrics::global();
    let aggregator = Aggregator::start(&config, Some(metrics))
        .await
        .map_err(|e| {
            tracing::error!("Failed to start aggregator: {:#}", e);
            io::Error::new(io::ErrorKind::Other, e.to_string())
        })?;

    let state = web::Data::new(aggregator.state().clone());

    // Runs until SIGINT/SIGTERM; actix handles the signals.
    let result = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(handlers::configure)
    })
    .bind((config.app.host.as_str(), config.app.port))?
    .run()
    .await;

    tracing::info!("HTTP server stopped, draining event buffer");
    aggregator.shutdown().await;

    result
}
