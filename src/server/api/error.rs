//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Serialize;

use crate::db::DatabaseError;

/// Internal server error message.
///
/// Persistence and other unexpected failures are logged server-side; the
/// client only ever sees this.
const INTERNAL_ERROR_MESSAGE: &str =
    "an internal server error occurred; contact the system administrator for more information";

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid credential.
    #[error("{0}")]
    Unauthorized(String),

    /// The authenticated consumer has been disabled.
    #[error("consumer disabled")]
    ConsumerDisabled,

    /// A submit or claim quota was hit.
    #[error("{0}")]
    QuotaExceeded(String),

    /// Job missing or not owned by the caller.
    #[error("job not found")]
    JobNotFound,

    /// Invalid request payload or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The server has no worker shared token configured.
    #[error("server missing worker token configuration")]
    WorkerTokenUnset,

    /// Internal server error.
    #[error("internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<DatabaseError> for Error {
    fn from(e: DatabaseError) -> Self {
        Error::Internal(e.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            Self::ConsumerDisabled => (StatusCode::FORBIDDEN, self.to_string()),
            Self::QuotaExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Self::JobNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::WorkerTokenUnset => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    String::from(INTERNAL_ERROR_MESSAGE),
                )
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
