use std::fmt;

use cardscan_core::model::{Fields, NormalizedImage, RecognitionMode, TaskState};
use cardscan_core::new_ulid;
use tokio::sync::oneshot;
use tokio::time::Instant;
use ulid::Ulid;

use crate::admission::AdmissionPermit;
use crate::error::DispatchError;

/// Opaque task identifier, assigned at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Ulid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(new_ulid())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a caller hands to the dispatcher.
#[derive(Debug, Clone)]
pub struct TaskPayload {
    pub image: NormalizedImage,
    pub mode: RecognitionMode,
}

/// The single result delivered for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(Fields),
    /// Deadline passed, either in the queue or during execution.
    Timeout,
    /// The model reported an error or its worker crashed.
    Failure(String),
    /// Rejected at admission.
    Overloaded,
    /// Rejected by preprocessing; no worker was involved.
    InvalidImage(String),
    /// The dispatcher cannot take work (shutting down or pool exhausted).
    Unavailable(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Terminal task state this outcome corresponds to, if the task was ever
    /// admitted.
    pub fn task_state(&self) -> Option<TaskState> {
        match self {
            Self::Success(_) => Some(TaskState::Completed),
            Self::Timeout => Some(TaskState::Timeout),
            Self::Failure(_) | Self::Unavailable(_) => Some(TaskState::Failed),
            Self::Overloaded | Self::InvalidImage(_) => None,
        }
    }
}

impl From<DispatchError> for TaskOutcome {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Overloaded(_) => Self::Overloaded,
            DispatchError::InvalidImage(reason) => Self::InvalidImage(reason),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// An admitted task. Owned by the dispatch path from admission until its
/// outcome is delivered; dropping it releases its admission permit.
#[derive(Debug)]
pub(crate) struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub submitted_at: Instant,
    pub deadline: Instant,
    reply: oneshot::Sender<TaskOutcome>,
    permit: AdmissionPermit,
}

impl Task {
    pub fn new(
        payload: TaskPayload,
        submitted_at: Instant,
        deadline: Instant,
        permit: AdmissionPermit,
    ) -> (Self, oneshot::Receiver<TaskOutcome>) {
        let (reply, rx) = oneshot::channel();
        let task = Self {
            id: TaskId::new(),
            payload,
            submitted_at,
            deadline,
            reply,
            permit,
        };
        (task, rx)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// The caller dropped its handle.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Releases the in-flight slot, then delivers `outcome`. Returns false if
    /// the caller had already gone.
    pub fn resolve(self, outcome: TaskOutcome) -> bool {
        let Self { reply, permit, .. } = self;
        drop(permit);
        reply.send(outcome).is_ok()
    }
}

/// Caller's side of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    deadline: Instant,
    wait_until: Instant,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        deadline: Instant,
        wait_until: Instant,
        rx: oneshot::Receiver<TaskOutcome>,
    ) -> Self {
        Self {
            id,
            deadline,
            wait_until,
            rx,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the outcome, never longer than the deadline plus the
    /// configured margin.
    ///
    /// Dropping the handle instead abandons the task: it still runs, but its
    /// result is discarded.
    pub async fn await_result(self) -> TaskOutcome {
        match tokio::time::timeout_at(self.wait_until, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => TaskOutcome::Failure("task dropped by dispatcher".to_string()),
            Err(_) => TaskOutcome::Timeout,
        }
    }
}
