use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cardscan_core::api::{ErrorKind, ErrorResponse};
use cardscan_core::model::Fields;
use cardscan_dispatch::TaskOutcome;
use thiserror::Error;

/// Seconds a client is told to back off after an overload rejection.
pub const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("service overloaded; retry later")]
    Overloaded,
    #[error("recognition timed out")]
    Timeout,
    #[error("recognition failed: {0}")]
    Recognition(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::InvalidImage(_) => ErrorKind::InvalidImage,
            Self::Overloaded => ErrorKind::Overloaded,
            Self::Timeout => ErrorKind::Timeout,
            Self::Recognition(_) => ErrorKind::RecognitionError,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::InvalidImage(_) => StatusCode::BAD_REQUEST,
            Self::Overloaded | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Recognition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Unwraps a successful outcome, mapping everything else to its HTTP error.
    pub fn from_outcome(outcome: TaskOutcome) -> Result<Fields, Self> {
        match outcome {
            TaskOutcome::Success(fields) => Ok(fields),
            TaskOutcome::Timeout => Err(Self::Timeout),
            TaskOutcome::Failure(msg) => Err(Self::Recognition(msg)),
            TaskOutcome::Overloaded => Err(Self::Overloaded),
            TaskOutcome::InvalidImage(msg) => Err(Self::InvalidImage(msg)),
            TaskOutcome::Unavailable(msg) => Err(Self::Unavailable(msg)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            kind: self.kind(),
            message: self.to_string(),
        };
        let mut resp = (status, Json(body)).into_response();
        if matches!(self, Self::Overloaded) {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        resp
    }
}
