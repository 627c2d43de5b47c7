//! Collaborators the dispatcher drives but does not implement.
//!
//! Preprocessing runs on the caller's side of admission. Models are loaded and
//! used on their worker's own thread, so a [`RecognitionModel`] never needs to
//! be `Send` or `Sync`.

use std::fmt;

use cardscan_core::model::{Fields, NormalizedImage, RecognitionMode};
use cardscan_core::validation::ImageError;
use thiserror::Error;

/// Index of a worker slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Preprocessing refused the input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidImage(pub String);

impl From<ImageError> for InvalidImage {
    fn from(e: ImageError) -> Self {
        Self(e.to_string())
    }
}

/// Clean failure reported by a model; the model is assumed to still be usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct RecognitionError(pub String);

/// Turns raw upload bytes into the image a model consumes.
pub trait Preprocessor: Send + Sync + 'static {
    /// Pure transformation; may be called concurrently from many requests.
    fn preprocess(&self, raw: &[u8]) -> Result<NormalizedImage, InvalidImage>;
}

/// A loaded recognition model, exclusively owned by one worker.
pub trait RecognitionModel {
    /// Extracts fields from one image.
    fn recognize(
        &mut self,
        image: &NormalizedImage,
        mode: RecognitionMode,
    ) -> Result<Fields, RecognitionError>;

    /// Drops caches and scratch buffers. Called after every task when memory
    /// optimization is enabled.
    fn reclaim(&mut self) {}
}

/// Builds models for worker slots.
///
/// `load` runs on the worker thread that will own the model and may block for
/// as long as the model takes to load.
pub trait ModelLoader: Send + Sync + 'static {
    /// Loads a fresh model instance for `slot`.
    fn load(&self, slot: SlotId) -> anyhow::Result<Box<dyn RecognitionModel>>;
}
