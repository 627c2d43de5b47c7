//! Domain types shared by the dispatcher and the HTTP service.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extracted fields returned by a recognition model.
///
/// The dispatcher forwards these untouched; their keys are a contract between
/// the model and the HTTP caller.
pub type Fields = BTreeMap<String, String>;

/// Which document (and which side of it) the caller expects.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardSide {
    /// National id card, portrait side.
    Front,
    /// National id card, issuing-authority side.
    Back,
    /// Permanent residence card, 2017+ layout.
    ForeignNew,
    /// Permanent residence card, pre-2017 layout.
    ForeignOld,
    /// Let the model detect the document type.
    #[default]
    Auto,
}

impl fmt::Display for CardSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Front => "front",
            Self::Back => "back",
            Self::ForeignNew => "foreign_new",
            Self::ForeignOld => "foreign_old",
            Self::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// A card side name that is not one of the known values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown card side {0:?}")]
pub struct UnknownCardSide(pub String);

impl FromStr for CardSide {
    type Err = UnknownCardSide;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "front" => Ok(Self::Front),
            "back" => Ok(Self::Back),
            "foreign_new" => Ok(Self::ForeignNew),
            "foreign_old" => Ok(Self::ForeignOld),
            "auto" | "" => Ok(Self::Auto),
            other => Err(UnknownCardSide(other.to_string())),
        }
    }
}

/// Recognition-side metadata travelling with every task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecognitionMode {
    /// Expected document side.
    #[serde(default)]
    pub side: CardSide,
    /// Trade accuracy for latency.
    #[serde(default)]
    pub fast: bool,
}

/// Image container formats accepted by the preprocessing step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// JPEG / JFIF.
    Jpeg,
    /// PNG.
    Png,
    /// Windows bitmap.
    Bmp,
    /// TIFF, either byte order.
    Tiff,
}

impl ImageFormat {
    /// Lowercase short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
        }
    }
}

/// Output of preprocessing; the only image representation a worker sees.
///
/// The pixel buffer is shared so handing a task to a worker thread does not
/// copy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    /// Container format detected during preprocessing.
    pub format: ImageFormat,
    /// Normalized image bytes.
    pub data: Arc<[u8]>,
}

impl NormalizedImage {
    /// Wraps already-normalized bytes.
    pub fn new(format: ImageFormat, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            format,
            data: data.into(),
        }
    }

    /// Size of the image buffer in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lifecycle of a recognition task.
///
/// `Queued -> Assigned -> {Completed, Failed, Timeout, Abandoned}`; a task may
/// also go straight from `Queued` to `Timeout` or `Abandoned`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted and waiting for an idle worker.
    Queued,
    /// Running on a worker.
    Assigned,
    /// Finished with extracted fields.
    Completed,
    /// Model error, worker crash, or no workers left.
    Failed,
    /// Deadline passed, queued or executing.
    Timeout,
    /// The caller went away before the result was delivered.
    Abandoned,
}

impl TaskState {
    /// True once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Assigned)
    }
}

/// Runtime state of a worker slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Loaded and waiting for a task.
    Idle,
    /// Executing a task.
    Busy,
    /// Quarantined; waiting for (or out of) replacement attempts.
    Failed,
    /// Shut down with the dispatcher.
    Stopped,
}

/// Monotonic task counters since startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounters {
    /// Tasks accepted into the queue.
    pub admitted: u64,
    /// Submissions refused as overloaded.
    pub rejected: u64,
    /// Tasks delivered with a result.
    pub completed: u64,
    /// Tasks delivered with a failure or as unavailable.
    pub failed: u64,
    /// Tasks delivered as timed out.
    pub timed_out: u64,
    /// Tasks whose caller stopped waiting.
    pub abandoned: u64,
    /// Workers successfully swapped in after a quarantine.
    pub replacements: u64,
}

/// Point-in-time view of the dispatcher, used by health reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Configured number of worker slots.
    pub pool_size: usize,
    /// Slots ready for work.
    pub idle: usize,
    /// Slots running a task.
    pub busy: usize,
    /// Quarantined slots.
    pub failed: usize,
    /// Slots shut down.
    pub stopped: usize,
    /// Tasks waiting for a worker.
    pub queue_depth: usize,
    /// Queue capacity.
    pub max_queue_depth: usize,
    /// Admitted tasks not yet resolved (queued + executing).
    pub in_flight: usize,
    /// Upper bound on `in_flight`.
    pub admission_ceiling: usize,
    /// Set once the pool can no longer field any worker.
    pub exhausted: bool,
    /// Totals since startup.
    pub counters: TaskCounters,
}
