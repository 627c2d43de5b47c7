use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Why admission turned a task away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Queued plus executing tasks reached the admission ceiling.
    CeilingReached,
    /// The task queue is at its maximum depth.
    QueueFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CeilingReached => f.write_str("admission ceiling reached"),
            Self::QueueFull => f.write_str("task queue full"),
        }
    }
}

/// Errors surfaced by dispatcher operations.
///
/// Only [`DispatchError::PoolExhausted`] and [`DispatchError::Startup`] are
/// service-level; everything else concerns a single task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("service busy ({0}); retry later")]
    Overloaded(RejectReason),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error("worker pool exhausted: no worker could be started")]
    PoolExhausted,
    #[error("worker pool failed to start: {0}")]
    Startup(String),
    #[error("invalid dispatcher configuration: {0}")]
    Config(#[from] ConfigError),
}
