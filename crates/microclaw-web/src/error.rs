//! Mapping of coordinator errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use microclaw_protocol::ErrorResponse;
use thiserror::Error;

/// An error returned from a handler as `{"error": "..."}`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<microclaw_server::Error> for ApiError {
    fn from(err: microclaw_server::Error) -> Self {
        use microclaw_server::Error;

        let status = match &err {
            Error::Busy => StatusCode::CONFLICT,
            Error::NotConnected | Error::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            Error::Connection { .. }
            | Error::Io(_)
            | Error::SubprocessFailure { .. }
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
