use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

use crate::api::api_objects::JobId;

/// Reasons a submission is refused before any job record exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("queue full: {max} jobs already waiting")]
    QueueFull { max: usize },

    #[error("too many messages: {count} exceeds the limit of {max}")]
    TooManyMessages { count: usize, max: usize },

    #[error("content too large: message {index} is {size} bytes, limit is {max}")]
    ContentTooLarge { index: usize, size: usize, max: usize },

    #[error("malformed submission: at least one message is required")]
    EmptyMessages,

    #[error("not accepting new jobs: shutting down")]
    ShuttingDown,
}

/// Errors surfaced by the HTTP adapter.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Admission(AdmissionError::QueueFull { .. })
            | ApiError::Admission(AdmissionError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Admission(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
