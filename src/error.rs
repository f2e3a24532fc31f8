//! Error types for the gateway.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::backend::BackendError;
use crate::models::ErrorResponse;

/// Errors raised while configuring or starting the gateway.
///
/// Any of these is fatal: the process refuses to start rather than run
/// with undefined admission or caching behaviour.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid or inconsistent configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// User service client could not be built
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O errors (listener bind, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway startup operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced to HTTP callers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after: u64 },

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Server error occurred");
        }

        let body = ErrorResponse {
            error: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();

        if let Self::RateLimited { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
