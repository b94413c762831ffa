/// Error types for aggregator-service
///
/// Errors are converted to JSON HTTP responses for API clients.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use dedup_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for aggregator-service operations
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Request body or event fields failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Well-formed request that cannot be served (e.g. empty batch, bad limit)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Buffer full or closed; the producer should retry later
    #[error("Service busy: {0}")]
    ServiceBusy(String),

    /// Dedup store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let error = match self {
            AppError::Validation(_) => "validation_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ServiceBusy(_) => "service_busy",
            AppError::Storage(_) => "storage_error",
            AppError::Internal(_) => "server_error",
        };

        HttpResponse::build(status).json(ErrorResponse {
            error: error.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        })
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}
