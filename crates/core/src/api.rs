//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};

use crate::model::{CardSide, Fields, PoolSnapshot};

/// Upper bound on images in one batch request.
pub const MAX_BATCH_IMAGES: usize = 10;

/// Header carrying the API key when keys are configured.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Single-image recognition request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizeRequest {
    /// Base64 image, with or without a `data:...;base64,` prefix.
    pub image: String,
    /// Expected card side.
    #[serde(default)]
    pub side: CardSide,
    /// Trade accuracy for latency.
    #[serde(default)]
    pub fast_mode: bool,
    /// Caller-side wait budget; clamped to the service task timeout.
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

/// Single-image recognition response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizeResponse {
    /// Fields extracted by the model.
    pub fields: Fields,
    /// Wall time spent on the request.
    pub elapsed_ms: u64,
}

/// One entry of a batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchImage {
    /// Base64 image, as in [`RecognizeRequest::image`].
    pub image: String,
    /// Expected card side.
    #[serde(default)]
    pub side: CardSide,
    /// Trade accuracy for latency.
    #[serde(default)]
    pub fast_mode: bool,
}

/// Batch recognition request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecognizeRequest {
    /// Between one and [`MAX_BATCH_IMAGES`] images.
    pub images: Vec<BatchImage>,
}

/// Batch recognition response.
///
/// `results[i]` is `None` for every index listed in `failed_indices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecognizeResponse {
    /// One entry per input image, in input order.
    pub results: Vec<Option<Fields>>,
    /// Ascending indices of images that produced no result.
    pub failed_indices: Vec<usize>,
    /// Wall time spent on the whole batch.
    pub elapsed_ms: u64,
}

/// Coarse service health.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Tasks are being accepted.
    Healthy,
    /// Shutting down or out of workers.
    Unhealthy,
}

/// Health endpoint payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status; also reflected in the HTTP status code.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Unix epoch milliseconds when the report was made.
    pub timestamp_ms: i64,
    /// Dispatcher state.
    pub pool: PoolSnapshot,
}

/// Machine-readable error category returned in error bodies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Admission refused; retry later.
    Overloaded,
    /// Payload is not a supported image.
    InvalidImage,
    /// Deadline passed before a result.
    Timeout,
    /// The model could not read the card.
    RecognitionError,
    /// No workers are available.
    Unavailable,
    /// Missing or wrong API key.
    Unauthorized,
    /// Malformed request.
    BadRequest,
    /// Unexpected server fault.
    Internal,
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}
