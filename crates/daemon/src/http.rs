use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cardscan_core::api::{
    BatchRecognizeRequest, BatchRecognizeResponse, HealthStatus, RecognizeRequest,
    RecognizeResponse, API_KEY_HEADER, MAX_BATCH_IMAGES,
};
use cardscan_core::model::{CardSide, RecognitionMode};
use cardscan_core::validation::MAX_IMAGE_BYTES;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::config::DaemonConfig;
use crate::error::AppError;
use crate::service::RecognitionService;

/// Largest request body: a full batch of maximum-size images in base64, plus
/// room for the JSON around them.
pub const MAX_BODY_BYTES: usize = (MAX_IMAGE_BYTES / 3 * 4 + 64 * 1024) * MAX_BATCH_IMAGES;

#[derive(Clone)]
pub struct AppState {
    pub service: RecognitionService,
    pub config: Arc<DaemonConfig>,
}

impl AppState {
    pub fn new(service: RecognitionService, config: DaemonConfig) -> Self {
        Self {
            service,
            config: Arc::new(config),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
        if self.config.accepts_key(presented) {
            return Ok(());
        }
        warn!(key_present = presented.is_some(), "rejected request with bad API key");
        Err(AppError::Unauthorized)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/health", get(health))
        .route("/v1/ocr/idcard", post(recognize))
        .route("/v1/ocr/idcard/batch", post(recognize_batch))
        .route("/v1/ocr/idcard/upload", post(recognize_upload))
        .route("/v1/ocr/idcard/batch/upload", post(recognize_card_upload))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.service.health();
    let code = match body.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(body))
}

async fn recognize(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Result<Json<RecognizeResponse>, AppError> {
    state.authorize(&headers)?;
    let Json(req) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    Ok(Json(state.service.recognize(req).await?))
}

async fn recognize_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<BatchRecognizeRequest>, JsonRejection>,
) -> Result<Json<BatchRecognizeResponse>, AppError> {
    state.authorize(&headers)?;
    let Json(req) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    Ok(Json(state.service.recognize_batch(req).await?))
}

async fn recognize_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RecognizeResponse>, AppError> {
    state.authorize(&headers)?;
    let mut form = UploadForm::read(multipart).await?;
    let raw = form
        .files
        .remove("image")
        .ok_or_else(|| AppError::BadRequest("missing file field `image`".into()))?;
    let mode = RecognitionMode {
        side: form.side,
        fast: form.fast_mode,
    };
    Ok(Json(state.service.recognize_bytes(raw, mode, None).await?))
}

async fn recognize_card_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchRecognizeResponse>, AppError> {
    state.authorize(&headers)?;
    let mut form = UploadForm::read(multipart).await?;
    let front = form.files.remove("front_image");
    let back = form.files.remove("back_image");
    Ok(Json(
        state
            .service
            .recognize_card(front, back, form.fast_mode)
            .await?,
    ))
}

const FILE_FIELDS: [&str; 3] = ["image", "front_image", "back_image"];

/// Fields of a multipart upload. Unknown fields are ignored and empty file
/// parts count as absent.
#[derive(Debug, Default)]
struct UploadForm {
    files: HashMap<String, Vec<u8>>,
    side: CardSide,
    fast_mode: bool,
}

impl UploadForm {
    async fn read(multipart: Result<Multipart, MultipartRejection>) -> Result<Self, AppError> {
        let mut multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
            let Some(name) = field.name().map(str::to_owned) else {
                continue;
            };
            match name.as_str() {
                "side" => {
                    let text = field.text().await.map_err(bad_multipart)?;
                    form.side = text
                        .parse()
                        .map_err(|e| AppError::BadRequest(format!("{e}")))?;
                }
                "fast_mode" => {
                    let text = field.text().await.map_err(bad_multipart)?;
                    form.fast_mode = parse_flag(&text)?;
                }
                file if FILE_FIELDS.contains(&file) => {
                    let bytes = field.bytes().await.map_err(bad_multipart)?;
                    if !bytes.is_empty() {
                        form.files.insert(name, bytes.to_vec());
                    }
                }
                _ => {}
            }
        }
        Ok(form)
    }
}

fn bad_multipart(e: MultipartError) -> AppError {
    AppError::BadRequest(e.body_text())
}

/// Form booleans as browsers and curl send them.
fn parse_flag(text: &str) -> Result<bool, AppError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" | "" => Ok(false),
        other => Err(AppError::BadRequest(format!(
            "fast_mode must be a boolean, got {other:?}"
        ))),
    }
}
