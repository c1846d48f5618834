//! Mapping of engine errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use crate::error::Error;

/// Error body: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(Error::Validation(message.into()))
    }

    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::NotOwner { .. } => (StatusCode::CONFLICT, "not_owner"),
            Error::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            Error::ClaimContention { .. } => (StatusCode::CONFLICT, "claim_contention"),
            Error::SessionInvalid => (StatusCode::UNAUTHORIZED, "session_invalid"),
            Error::SessionExpired => (StatusCode::UNAUTHORIZED, "session_expired"),
            Error::Validation(_) | Error::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            Error::Database(_) | Error::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(code, "request failed: {}", self.0);
        } else if status != StatusCode::CONFLICT {
            warn!(code, "request rejected: {}", self.0);
        }
        let body = json!({
            "error": {
                "code": code,
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
