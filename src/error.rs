//! Error abstractions for the admin API surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// A result type used by admin API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Admin API error variants.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The resource specified in the path is not found.
    #[error("the resource specified in the path is not found")]
    NotFound,
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The server hit an internal error, but remains online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Ise(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Ise(err) => {
                tracing::error!(error = ?err, "error handling admin API request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
