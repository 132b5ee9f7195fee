// Error responses for the sandbox API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use sandbox_common::{QueueError, ValidationError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid request body: {0}")]
    MalformedBody(String),

    #[error("Job not found")]
    NotFound,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Queue(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Queue(e) => {
                tracing::error!(error = %e, "Queue operation failed");
                if e.is_retryable() {
                    "Service temporarily unavailable, please retry".to_string()
                } else {
                    "Internal server error".to_string()
                }
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            status: "error",
            message,
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::Validation(ValidationError::MissingCode).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Queue(QueueError::Unavailable("refused".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Queue(QueueError::Corrupt {
                job_id: "x".into(),
                reason: "bad json".into()
            })
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(ApiError::NotFound.to_string(), "Job not found");
    }
}
