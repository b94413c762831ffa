/// Read-only handlers: statistics, liveness and metrics
use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::HealthResponse;

pub async fn stats(state: web::Data<AppState>) -> Result<HttpResponse> {
    let snapshot = state.stats.snapshot().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Event aggregator is running"
    }))
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        service: "aggregator-service".to_string(),
    })
}

/// Prometheus text exposition of the default registry
pub async fn metrics(state: web::Data<AppState>) -> Result<HttpResponse> {
    state.refresh_gauges();

    let body = metrics::render().map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}
