use std::fmt::Display;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use murmur_types::api::ApiResponse;

/// Failure outcomes of the HTTP API. Every variant renders as the standard
/// `{success: false, message, detail?}` envelope.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: &'static str,
        detail: Option<String>,
    },

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("Too many requests")]
    RateLimited,

    /// The payload is the public message only; the cause has already been logged.
    #[error("{0}")]
    Internal(&'static str),
}

impl ApiError {
    pub fn validation(message: &'static str, detail: impl Into<String>) -> Self {
        Self::Validation {
            message,
            detail: Some(detail.into()),
        }
    }

    /// Log `cause` and return a generic 500 carrying only `public`.
    pub fn internal(public: &'static str, cause: impl Display) -> Self {
        error!("{}: {}", public, cause);
        Self::Internal(public)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let detail = match self {
            Self::Validation { detail, .. } => detail,
            _ => None,
        };

        (status, Json(ApiResponse::failure(message, detail))).into_response()
    }
}

/// Run a blocking store call off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal("Internal server error", format!("spawn_blocking join error: {e}")))?
}
