use std::time::{Duration, Instant};

use cardscan_core::api::{
    BatchRecognizeRequest, BatchRecognizeResponse, HealthResponse, HealthStatus,
    RecognizeRequest, RecognizeResponse, MAX_BATCH_IMAGES,
};
use cardscan_core::model::{CardSide, RecognitionMode};
use cardscan_core::now_ms;
use cardscan_core::validation::decode_image_base64;
use cardscan_dispatch::{Dispatcher, TaskOutcome};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::AppError;

/// Request-level logic on top of the dispatcher: decoding, batching, health.
#[derive(Clone)]
pub struct RecognitionService {
    dispatcher: Dispatcher,
}

impl RecognitionService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn recognize(&self, req: RecognizeRequest) -> Result<RecognizeResponse, AppError> {
        let raw = decode_image_base64(&req.image)
            .map_err(|e| AppError::InvalidImage(e.to_string()))?;
        let mode = RecognitionMode {
            side: req.side,
            fast: req.fast_mode,
        };
        self.recognize_bytes(raw, mode, req.max_wait_ms.map(Duration::from_millis))
            .await
    }

    /// Recognizes an already-decoded image, e.g. a multipart upload.
    pub async fn recognize_bytes(
        &self,
        raw: Vec<u8>,
        mode: RecognitionMode,
        max_wait: Option<Duration>,
    ) -> Result<RecognizeResponse, AppError> {
        let started = Instant::now();
        let outcome = self.dispatcher.recognize(raw, mode, max_wait).await;
        let fields = AppError::from_outcome(outcome)?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(side = %mode.side, fast = mode.fast, elapsed_ms, "card recognized");
        Ok(RecognizeResponse { fields, elapsed_ms })
    }

    /// Runs every image through the dispatcher concurrently. One bad image
    /// does not fail the batch.
    pub async fn recognize_batch(
        &self,
        req: BatchRecognizeRequest,
    ) -> Result<BatchRecognizeResponse, AppError> {
        let count = req.images.len();
        if count == 0 {
            return Err(AppError::BadRequest("images must not be empty".into()));
        }
        if count > MAX_BATCH_IMAGES {
            return Err(AppError::BadRequest(format!(
                "at most {MAX_BATCH_IMAGES} images per batch, got {count}"
            )));
        }
        let images = req
            .images
            .into_iter()
            .map(|image| {
                let raw = decode_image_base64(&image.image).map_err(|e| e.to_string());
                let mode = RecognitionMode {
                    side: image.side,
                    fast: image.fast_mode,
                };
                (raw, mode)
            })
            .collect();
        self.run_batch(images).await
    }

    /// Both sides of one card. Results are ordered front first; a missing
    /// side is skipped, but at least one must be present.
    pub async fn recognize_card(
        &self,
        front: Option<Vec<u8>>,
        back: Option<Vec<u8>>,
        fast: bool,
    ) -> Result<BatchRecognizeResponse, AppError> {
        let images: Vec<_> = [(front, CardSide::Front), (back, CardSide::Back)]
            .into_iter()
            .filter_map(|(raw, side)| raw.map(|raw| (Ok(raw), RecognitionMode { side, fast })))
            .collect();
        if images.is_empty() {
            return Err(AppError::BadRequest(
                "upload at least one of front_image, back_image".into(),
            ));
        }
        self.run_batch(images).await
    }

    async fn run_batch(
        &self,
        images: Vec<(Result<Vec<u8>, String>, RecognitionMode)>,
    ) -> Result<BatchRecognizeResponse, AppError> {
        if !self.dispatcher.is_available() {
            return Err(AppError::Unavailable("recognition is not available".into()));
        }

        let count = images.len();
        let started = Instant::now();
        let mut set = JoinSet::new();
        for (index, (raw, mode)) in images.into_iter().enumerate() {
            let dispatcher = self.dispatcher.clone();
            set.spawn(async move {
                let outcome = match raw {
                    Ok(raw) => dispatcher.recognize(raw, mode, None).await,
                    Err(reason) => TaskOutcome::InvalidImage(reason),
                };
                (index, outcome)
            });
        }

        let mut results = vec![None; count];
        let mut failed_indices = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (index, outcome) = joined.map_err(AppError::internal)?;
            match outcome {
                TaskOutcome::Success(fields) => results[index] = Some(fields),
                other => {
                    warn!(index, outcome = ?other, "batch image failed");
                    failed_indices.push(index);
                }
            }
        }
        failed_indices.sort_unstable();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(count, failed = failed_indices.len(), elapsed_ms, "batch recognized");
        Ok(BatchRecognizeResponse {
            results,
            failed_indices,
            elapsed_ms,
        })
    }

    pub fn health(&self) -> HealthResponse {
        let status = if self.dispatcher.is_available() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp_ms: now_ms(),
            pool: self.dispatcher.stats(),
        }
    }
}
