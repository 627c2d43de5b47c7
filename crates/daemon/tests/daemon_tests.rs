//! Integration tests for the daemon: config loading, error mapping, and the
//! HTTP surface served against the demo model.

use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use base64::Engine as _;
use cardscan_core::api::{
    BatchRecognizeResponse, ErrorKind, ErrorResponse, HealthResponse, HealthStatus,
    RecognizeResponse,
};
use cardscan_daemon::config::DaemonConfig;
use cardscan_daemon::demo::DemoModelLoader;
use cardscan_daemon::error::AppError;
use cardscan_daemon::http::{router, AppState};
use cardscan_daemon::preprocess::ImagePreprocessor;
use cardscan_daemon::service::RecognitionService;
use cardscan_dispatch::{DispatchConfig, Dispatcher};
use reqwest::multipart::{Form, Part};
use serde_json::json;

/// 1x1 PNG, 70 bytes.
const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

fn jpeg_data_url() -> String {
    let bytes = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

fn png_bytes() -> Vec<u8> {
    base64::engine::general_purpose::STANDARD.decode(PNG_B64).unwrap()
}

fn file_part(bytes: Vec<u8>, file_name: &'static str) -> Part {
    Part::bytes(bytes).file_name(file_name)
}

fn test_config(pool_size: usize, max_queue_depth: usize, admission_ceiling: usize) -> DaemonConfig {
    DaemonConfig {
        listen: "127.0.0.1:0".into(),
        demo_latency_ms: 0,
        dispatch: DispatchConfig {
            pool_size,
            max_queue_depth,
            admission_ceiling,
            reap_interval_ms: 20,
            ..DispatchConfig::default()
        },
        ..DaemonConfig::default()
    }
}

async fn serve(cfg: DaemonConfig) -> (String, Dispatcher) {
    let dispatcher = Dispatcher::start(
        cfg.dispatch.clone(),
        Arc::new(DemoModelLoader::new(Duration::from_millis(cfg.demo_latency_ms))),
        Arc::new(ImagePreprocessor),
    )
    .await
    .unwrap();
    let app = router(AppState::new(RecognitionService::new(dispatcher.clone()), cfg));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), dispatcher)
}

#[test]
fn test_config_file_with_partial_dispatch_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cardscan.toml");
    std::fs::write(
        &path,
        r#"
listen = "0.0.0.0:9000"
api_keys = ["secret"]

[dispatch]
pool_size = 2
task_timeout_ms = 5000
"#,
    )
    .unwrap();

    let cfg = DaemonConfig::load_from(&path).unwrap();
    assert_eq!(cfg.listen, "0.0.0.0:9000");
    assert_eq!(cfg.api_keys, ["secret"]);
    assert_eq!(cfg.demo_latency_ms, DaemonConfig::default().demo_latency_ms);
    assert_eq!(cfg.dispatch.pool_size, 2);
    assert_eq!(cfg.dispatch.task_timeout_ms, 5000);
    assert_eq!(cfg.dispatch.max_queue_depth, DispatchConfig::default().max_queue_depth);
    assert!(cfg.auth_required());
}

#[test]
fn test_config_errors_name_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let err = DaemonConfig::load_from(&missing).unwrap_err();
    assert!(format!("{err:#}").contains("missing.toml"));

    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[dispatch\npool_size = ").unwrap();
    let err = DaemonConfig::load_from(&broken).unwrap_err();
    assert!(format!("{err:#}").contains("parse"));
}

#[test]
fn test_error_status_mapping() {
    let cases = [
        (AppError::Unauthorized, 401),
        (AppError::BadRequest("x".into()), 400),
        (AppError::InvalidImage("x".into()), 400),
        (AppError::Overloaded, 503),
        (AppError::Timeout, 504),
        (AppError::Recognition("x".into()), 422),
        (AppError::Unavailable("x".into()), 503),
        (AppError::Internal("x".into()), 500),
    ];
    for (err, code) in cases {
        let retry = matches!(err, AppError::Overloaded);
        let resp = err.into_response();
        assert_eq!(resp.status().as_u16(), code);
        assert_eq!(resp.headers().contains_key("retry-after"), retry);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recognize_png() {
    let (base, _d) = serve(test_config(1, 2, 3)).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/ocr/idcard"))
        .json(&json!({ "image": PNG_B64, "side": "front" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: RecognizeResponse = resp.json().await.unwrap();
    assert_eq!(body.fields["format"], "png");
    assert_eq!(body.fields["bytes"], "70");
    assert_eq!(body.fields["side"], "front");
    assert_eq!(body.fields["mode"], "accurate");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_image_is_400() {
    let (base, d) = serve(test_config(1, 2, 3)).await;
    let client = reqwest::Client::new();

    for image in ["%%%not base64%%%", "aGVsbG8gd29ybGQ="] {
        let resp = client
            .post(format!("{base}/v1/ocr/idcard"))
            .json(&json!({ "image": image }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: ErrorResponse = resp.json().await.unwrap();
        assert_eq!(body.kind, ErrorKind::InvalidImage);
    }
    assert_eq!(d.stats().counters.admitted, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_json_is_bad_request() {
    let (base, _d) = serve(test_config(1, 2, 3)).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/ocr/idcard"))
        .header("content-type", "application/json")
        .body("{\"side\": \"front\"")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(body.kind, ErrorKind::BadRequest);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_api_key_gate() {
    let cfg = DaemonConfig {
        api_keys: vec!["secret".into()],
        ..test_config(1, 2, 3)
    };
    let (base, _d) = serve(cfg).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/v1/ocr/idcard");
    let body = json!({ "image": jpeg_data_url() });

    let resp = client.post(&url).json(&body).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let err: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(err.kind, ErrorKind::Unauthorized);

    let resp = client
        .post(&url)
        .header("x-api-key", "wrong")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .post(&url)
        .header("x-api-key", "secret")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let ok: RecognizeResponse = resp.json().await.unwrap();
    assert_eq!(ok.fields["format"], "jpeg");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overload_returns_503_with_retry_after() {
    let cfg = DaemonConfig {
        demo_latency_ms: 300,
        ..test_config(1, 1, 1)
    };
    let (base, _d) = serve(cfg).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/v1/ocr/idcard");

    let first = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({ "image": PNG_B64 }))
                .send()
                .await
                .unwrap()
                .status()
                .as_u16()
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = client
        .post(&url)
        .json(&json!({ "image": PNG_B64 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    assert_eq!(resp.headers()["retry-after"], "1");
    let err: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(err.kind, ErrorKind::Overloaded);

    assert_eq!(first.await.unwrap(), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_returns_504() {
    let cfg = DaemonConfig {
        demo_latency_ms: 400,
        ..test_config(1, 2, 3)
    };
    let (base, d) = serve(cfg).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/ocr/idcard"))
        .json(&json!({ "image": PNG_B64, "max_wait_ms": 100 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 504);
    let err: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(d.stats().counters.timed_out, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_reports_failed_indices() {
    let (base, _d) = serve(test_config(2, 8, 10)).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/v1/ocr/idcard/batch");

    let resp = client
        .post(&url)
        .json(&json!({ "images": [
            { "image": PNG_B64, "side": "front" },
            { "image": "garbage!!" },
            { "image": jpeg_data_url(), "side": "back", "fast_mode": true },
        ]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: BatchRecognizeResponse = resp.json().await.unwrap();
    assert_eq!(body.results.len(), 3);
    assert_eq!(body.failed_indices, [1]);
    assert!(body.results[1].is_none());
    assert_eq!(body.results[0].as_ref().unwrap()["side"], "front");
    let third = body.results[2].as_ref().unwrap();
    assert_eq!(third["format"], "jpeg");
    assert_eq!(third["mode"], "fast");

    let too_many: Vec<_> = (0..11).map(|_| json!({ "image": PNG_B64 })).collect();
    let resp = client
        .post(&url)
        .json(&json!({ "images": too_many }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_single_image() {
    let (base, d) = serve(test_config(1, 2, 3)).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/v1/ocr/idcard/upload");

    let form = Form::new()
        .part("image", file_part(png_bytes(), "card.png"))
        .text("side", "back")
        .text("fast_mode", "true")
        .text("debug", "false");
    let resp = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: RecognizeResponse = resp.json().await.unwrap();
    assert_eq!(body.fields["format"], "png");
    assert_eq!(body.fields["bytes"], "70");
    assert_eq!(body.fields["side"], "back");
    assert_eq!(body.fields["mode"], "fast");

    let form = Form::new().text("side", "front");
    let resp = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let err: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(err.kind, ErrorKind::BadRequest);

    let form = Form::new()
        .part("image", file_part(png_bytes(), "card.png"))
        .text("side", "sideways");
    let resp = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let form = Form::new().part("image", file_part(b"plain text".to_vec(), "notes.txt"));
    let resp = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let err: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidImage);

    let resp = client
        .post(&url)
        .json(&json!({ "image": PNG_B64 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    assert_eq!(d.stats().counters.admitted, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_card_sides() {
    let cfg = DaemonConfig {
        api_keys: vec!["secret".into()],
        ..test_config(2, 4, 6)
    };
    let (base, _d) = serve(cfg).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/v1/ocr/idcard/batch/upload");

    let form = Form::new().part("front_image", file_part(png_bytes(), "front.png"));
    let resp = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let form = Form::new()
        .part("front_image", file_part(png_bytes(), "front.png"))
        .part("back_image", file_part(b"not an image".to_vec(), "back.png"))
        .text("fast_mode", "on");
    let resp = client
        .post(&url)
        .header("x-api-key", "secret")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: BatchRecognizeResponse = resp.json().await.unwrap();
    assert_eq!(body.results.len(), 2);
    assert_eq!(body.failed_indices, [1]);
    let front = body.results[0].as_ref().unwrap();
    assert_eq!(front["side"], "front");
    assert_eq!(front["mode"], "fast");

    let form = Form::new()
        .part("front_image", file_part(Vec::new(), ""))
        .part("back_image", file_part(png_bytes(), "back.png"));
    let resp = client
        .post(&url)
        .header("x-api-key", "secret")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: BatchRecognizeResponse = resp.json().await.unwrap();
    assert_eq!(body.results.len(), 1);
    assert!(body.failed_indices.is_empty());
    assert_eq!(body.results[0].as_ref().unwrap()["side"], "back");

    let form = Form::new().text("fast_mode", "false");
    let resp = client
        .post(&url)
        .header("x-api-key", "secret")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let err: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(err.kind, ErrorKind::BadRequest);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_reflects_dispatcher_state() {
    let (base, d) = serve(test_config(2, 4, 6)).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = client.get(format!("{base}/v1/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let health: HealthResponse = resp.json().await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.pool.pool_size, 2);
    assert_eq!(health.pool.idle, 2);

    d.shutdown().await;
    let resp = client.get(format!("{base}/v1/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    let health: HealthResponse = resp.json().await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.pool.stopped, 2);
}
