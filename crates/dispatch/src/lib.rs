#![forbid(unsafe_code)]

//! Admission-controlled dispatch of recognition tasks onto a fixed pool of
//! model workers.
//!
//! A task is admitted against a global in-flight ceiling, waits in a bounded
//! FIFO queue, runs on exactly one worker under a deadline, and resolves to
//! exactly one [`TaskOutcome`]. Workers that crash or overrun a deadline are
//! quarantined and replaced in the background.

mod admission;
pub mod config;
mod dispatcher;
pub mod engine;
pub mod error;
mod pool;
mod queue;
mod task;
mod worker;

pub use admission::{Admission, AdmissionController, AdmissionPermit};
pub use config::{ConfigError, DispatchConfig, Recommendation};
pub use dispatcher::Dispatcher;
pub use engine::{
    InvalidImage, ModelLoader, Preprocessor, RecognitionError, RecognitionModel, SlotId,
};
pub use error::{DispatchError, RejectReason};
pub use task::{TaskHandle, TaskId, TaskOutcome, TaskPayload};
