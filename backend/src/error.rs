use actix_web::{HttpResponse, ResponseError, http::StatusCode, http::header};
use shared::ErrorResponse;

use crate::classifier::InferenceError;
use crate::limiter::RateLimited;
use crate::upload::Rejection;

const MODEL_UNAVAILABLE_SUGGESTION: &str =
    "Check the model artifact path and restart the service, or retry later";

/// Everything the prediction endpoint can answer besides a prediction.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(#[from] Rejection),
    #[error("Missing required field '{0}'")]
    MissingFile(&'static str),
    #[error("Malformed multipart body: {0}")]
    MalformedBody(String),
    #[error("Model not loaded: {0}")]
    ModelUnavailable(String),
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error("Prediction failed: {0}")]
    Internal(#[from] InferenceError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) | ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingFile(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ApiError::InvalidInput(rejection) => {
                ErrorResponse::new(rejection.reason(), rejection.to_string())
            }
            ApiError::MissingFile(field) => ErrorResponse::new(
                "Missing required field",
                format!("Expected a multipart form with a '{field}' file field"),
            ),
            ApiError::MalformedBody(details) => {
                ErrorResponse::new("Malformed request body", details.clone())
            }
            ApiError::ModelUnavailable(reason) => {
                ErrorResponse::new("Model not loaded", reason.clone())
                    .with_suggestion(MODEL_UNAVAILABLE_SUGGESTION)
            }
            ApiError::RateLimited(limited) => ErrorResponse::new(
                "Rate limit exceeded",
                format!("Too many requests, retry in {}s", limited.retry_after_secs()),
            ),
            // The cause is logged by the handler and never sent to the client.
            ApiError::Internal(_) => ErrorResponse::new(
                "Internal server error",
                "The image could not be processed",
            ),
        };

        let mut response = HttpResponse::build(self.status_code());
        if let ApiError::RateLimited(limited) = self {
            response.insert_header((header::RETRY_AFTER, limited.retry_after_secs().to_string()));
        }
        response.json(body)
    }
}
