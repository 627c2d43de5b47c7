//! Scripted models for dispatcher tests.
//!
//! Image bytes are a small script: `"<tag> <millis> [fail|panic|poison]"`. The
//! model sleeps for `millis`, then succeeds, returns an error, or panics.
//! `poison` succeeds but makes the following `reclaim` panic.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cardscan_core::model::{Fields, ImageFormat, NormalizedImage, RecognitionMode};
use cardscan_dispatch::{
    DispatchConfig, Dispatcher, InvalidImage, ModelLoader, Preprocessor, RecognitionError,
    RecognitionModel, SlotId, TaskPayload,
};

#[derive(Debug, Clone)]
pub struct Run {
    pub tag: String,
    pub instance: usize,
    pub slot: SlotId,
    pub started: Instant,
}

#[derive(Debug, Default)]
pub struct Script {
    /// Load attempts so far; also the next instance number.
    pub loads: AtomicUsize,
    /// Loads at or past this count fail.
    pub load_limit: Option<usize>,
    pub runs: Mutex<Vec<Run>>,
    pub reclaims: AtomicUsize,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_after(loads: usize) -> Arc<Self> {
        Arc::new(Self {
            load_limit: Some(loads),
            ..Self::default()
        })
    }

    pub fn runs(&self) -> Vec<Run> {
        self.runs.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.runs().into_iter().map(|r| r.tag).collect()
    }
}

pub struct ScriptedLoader(pub Arc<Script>);

impl ModelLoader for ScriptedLoader {
    fn load(&self, slot: SlotId) -> anyhow::Result<Box<dyn RecognitionModel>> {
        let instance = self.0.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.0.load_limit {
            if instance >= limit {
                anyhow::bail!("model weights unavailable");
            }
        }
        Ok(Box::new(ScriptedModel {
            script: Arc::clone(&self.0),
            instance,
            slot,
            poisoned: false,
        }))
    }
}

struct ScriptedModel {
    script: Arc<Script>,
    instance: usize,
    slot: SlotId,
    poisoned: bool,
}

impl RecognitionModel for ScriptedModel {
    fn recognize(
        &mut self,
        image: &NormalizedImage,
        _mode: RecognitionMode,
    ) -> Result<Fields, RecognitionError> {
        let text = String::from_utf8_lossy(&image.data).into_owned();
        let mut parts = text.split_whitespace();
        let tag = parts.next().unwrap_or_default().to_string();
        let millis: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let action = parts.next().unwrap_or("ok");

        self.script.runs.lock().unwrap().push(Run {
            tag: tag.clone(),
            instance: self.instance,
            slot: self.slot,
            started: Instant::now(),
        });
        std::thread::sleep(Duration::from_millis(millis));

        match action {
            "fail" => Err(RecognitionError(format!("scripted failure for {tag}"))),
            "panic" => panic!("scripted panic for {tag}"),
            other => {
                self.poisoned = other == "poison";
                let mut fields = Fields::new();
                fields.insert("tag".into(), tag);
                fields.insert("instance".into(), self.instance.to_string());
                Ok(fields)
            }
        }
    }

    fn reclaim(&mut self) {
        if self.poisoned {
            panic!("scratch buffer corrupted");
        }
        self.script.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

/// Accepts anything not starting with `bad`.
pub struct PassThrough;

impl Preprocessor for PassThrough {
    fn preprocess(&self, raw: &[u8]) -> Result<NormalizedImage, InvalidImage> {
        if raw.starts_with(b"bad") {
            return Err(InvalidImage("unsupported image format".into()));
        }
        Ok(NormalizedImage::new(ImageFormat::Png, raw.to_vec()))
    }
}

pub fn config(pool_size: usize, max_queue_depth: usize, admission_ceiling: usize) -> DispatchConfig {
    DispatchConfig {
        pool_size,
        max_queue_depth,
        admission_ceiling,
        reap_interval_ms: 20,
        replacement_attempts: 3,
        replacement_backoff_ms: 10,
        ..DispatchConfig::default()
    }
}

pub async fn start(config: DispatchConfig, script: &Arc<Script>) -> Dispatcher {
    Dispatcher::start(
        config,
        Arc::new(ScriptedLoader(Arc::clone(script))),
        Arc::new(PassThrough),
    )
    .await
    .expect("dispatcher starts")
}

pub fn payload(script: &str) -> TaskPayload {
    TaskPayload {
        image: NormalizedImage::new(ImageFormat::Png, script.as_bytes().to_vec()),
        mode: RecognitionMode::default(),
    }
}

/// Polls `check` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < give_up, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
