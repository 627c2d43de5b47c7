//! Stand-in recognizer so the daemon runs without a real engine.
//!
//! It reports what it was given (format, size, SHA-256 of the bytes, side)
//! after sleeping for a configurable latency; fast mode halves the latency.

use std::time::Duration;

use cardscan_core::model::{Fields, NormalizedImage, RecognitionMode};
use cardscan_dispatch::{ModelLoader, RecognitionError, RecognitionModel, SlotId};
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DemoModelLoader {
    latency: Duration,
}

impl DemoModelLoader {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl ModelLoader for DemoModelLoader {
    fn load(&self, slot: SlotId) -> anyhow::Result<Box<dyn RecognitionModel>> {
        debug!(%slot, "loading demo model");
        Ok(Box::new(DemoModel {
            slot,
            latency: self.latency,
            scratch: Vec::new(),
        }))
    }
}

struct DemoModel {
    slot: SlotId,
    latency: Duration,
    scratch: Vec<u8>,
}

impl RecognitionModel for DemoModel {
    fn recognize(
        &mut self,
        image: &NormalizedImage,
        mode: RecognitionMode,
    ) -> Result<Fields, RecognitionError> {
        if image.is_empty() {
            return Err(RecognitionError("no image data".into()));
        }
        let latency = if mode.fast { self.latency / 2 } else { self.latency };
        std::thread::sleep(latency);

        self.scratch.clear();
        self.scratch.extend_from_slice(&image.data);
        let digest = Sha256::digest(&self.scratch);

        let mut fields = Fields::new();
        fields.insert("format".into(), image.format.as_str().into());
        fields.insert("bytes".into(), image.len().to_string());
        fields.insert("sha256".into(), hex::encode(digest));
        fields.insert("side".into(), mode.side.to_string());
        let speed = if mode.fast { "fast" } else { "accurate" };
        fields.insert("mode".into(), speed.into());
        fields.insert("worker".into(), self.slot.to_string());
        Ok(fields)
    }

    fn reclaim(&mut self) {
        self.scratch = Vec::new();
    }
}
