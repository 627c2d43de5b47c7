//! One recognition worker: a dedicated OS thread that loads and owns a model.
//!
//! The dispatcher talks to a worker only through its job channel, and the
//! worker answers each job through the job's oneshot. The model never leaves
//! the thread. When the job channel closes the thread finishes its current
//! call, drops the model and exits.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use cardscan_core::model::{Fields, NormalizedImage, RecognitionMode};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::engine::{ModelLoader, SlotId};
use crate::task::TaskId;

pub(crate) struct Job {
    pub task_id: TaskId,
    pub image: NormalizedImage,
    pub mode: RecognitionMode,
    pub reply: oneshot::Sender<JobReply>,
}

#[derive(Debug)]
pub(crate) enum JobError {
    /// Clean error returned by the model.
    Recognition(String),
    /// The model panicked; the worker thread has exited.
    Crashed(String),
}

pub(crate) type JobResult = Result<Fields, JobError>;

#[derive(Debug)]
pub(crate) struct JobReply {
    pub result: JobResult,
    /// The thread stops after this reply and must not be handed another job.
    pub exited: bool,
}

/// Resolves once the worker's model is loaded, or with the load error.
pub(crate) type Ready = oneshot::Receiver<Result<(), String>>;

#[derive(Debug)]
pub(crate) struct WorkerHandle {
    slot: SlotId,
    generation: u64,
    jobs: mpsc::Sender<Job>,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Starts a worker thread for `slot`. The returned [`Ready`] reports
    /// whether the model loaded.
    pub fn spawn(
        slot: SlotId,
        generation: u64,
        loader: Arc<dyn ModelLoader>,
        reclaim_after_task: bool,
    ) -> std::io::Result<(Self, Ready)> {
        let (jobs, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread = thread::Builder::new()
            .name(format!("{slot}.{generation}"))
            .spawn(move || run(slot, generation, loader, reclaim_after_task, rx, ready_tx))?;
        Ok((
            Self {
                slot,
                generation,
                jobs,
                thread,
            },
            ready_rx,
        ))
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A sender for handing this worker one job outside the pairing lock.
    pub fn sender(&self) -> mpsc::Sender<Job> {
        self.jobs.clone()
    }

    /// Detaches the worker. Its thread exits once any in-progress call returns
    /// and every outstanding sender is gone.
    pub fn retire(self) {
        debug!(slot = %self.slot, generation = self.generation, "worker retired");
    }

    /// Closes the job channel and waits for the thread to exit.
    pub fn join(self) -> thread::Result<()> {
        let Self { jobs, thread, .. } = self;
        drop(jobs);
        thread.join()
    }
}

fn run(
    slot: SlotId,
    generation: u64,
    loader: Arc<dyn ModelLoader>,
    reclaim_after_task: bool,
    jobs: mpsc::Receiver<Job>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let started = Instant::now();
    let loaded = panic::catch_unwind(AssertUnwindSafe(|| loader.load(slot)));
    let mut model = match loaded {
        Ok(Ok(model)) => model,
        Ok(Err(e)) => {
            let _ = ready.send(Err(format!("{e:#}")));
            return;
        }
        Err(payload) => {
            let _ = ready.send(Err(format!("model load panicked: {}", panic_message(payload.as_ref()))));
            return;
        }
    };
    drop(loader);
    if ready.send(Ok(())).is_err() {
        return;
    }
    info!(%slot, generation, load_ms = started.elapsed().as_millis() as u64, "worker ready");

    while let Ok(job) = jobs.recv() {
        let Job {
            task_id,
            image,
            mode,
            reply,
        } = job;
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| model.recognize(&image, mode)));
        let result = match result {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(e)) => Err(JobError::Recognition(e.0)),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(%slot, generation, %task_id, panic = %msg, "model panicked; worker exiting");
                let _ = reply.send(JobReply {
                    result: Err(JobError::Crashed(msg)),
                    exited: true,
                });
                return;
            }
        };
        let reclaimed = !reclaim_after_task
            || match panic::catch_unwind(AssertUnwindSafe(|| model.reclaim())) {
                Ok(()) => true,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    error!(%slot, generation, %task_id, panic = %msg, "reclaim panicked; worker exiting");
                    false
                }
            };
        debug!(
            %slot,
            %task_id,
            exec_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "job finished"
        );
        // The dispatcher may have stopped listening after a deadline overrun.
        let _ = reply.send(JobReply {
            result,
            exited: !reclaimed,
        });
        if !reclaimed {
            return;
        }
    }
    debug!(%slot, generation, "worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
