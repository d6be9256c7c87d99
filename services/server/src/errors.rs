//! HTTP-layer error taxonomy (spec.md §7), surfaced through the teacher's
//! frozen `HttpErrorEnvelope` contract (`http/response.rs`). Component-local
//! error enums (`platform_client::PlatformError`, `grouper::GrouperError`)
//! live next to the code that raises them and convert into this type only
//! at the HTTP boundary.

use axum::http::StatusCode;
use thiserror::Error;

/// HTTP-layer validation/lookup failures, mapped directly to status codes.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HttpError::Conflict(_) => StatusCode::CONFLICT,
            HttpError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            HttpError::BadRequest(_) => "BAD_REQUEST",
            HttpError::NotFound(_) => "NOT_FOUND",
            HttpError::Unauthorized(_) => "UNAUTHORIZED",
            HttpError::Conflict(_) => "CONFLICT",
            HttpError::Unavailable(_) => "SERVICE_UNAVAILABLE",
            HttpError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<sqlx::Error> for HttpError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => HttpError::NotFound("not found".to_owned()),
            other => HttpError::Internal(other.to_string()),
        }
    }
}

impl From<crate::grouper::GrouperError> for HttpError {
    fn from(err: crate::grouper::GrouperError) -> Self {
        HttpError::Internal(err.to_string())
    }
}
