//! The dispatcher: admission, FIFO pairing of tasks with idle workers,
//! deadline enforcement, and worker quarantine/replacement.
//!
//! All pairing decisions are made under one lock over the queue and the pool
//! (`pump`). Work that may block (running a model, loading a model, joining
//! threads) always happens outside it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use cardscan_core::model::{Fields, NormalizedImage, PoolSnapshot, RecognitionMode, TaskCounters};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionController};
use crate::config::DispatchConfig;
use crate::engine::{ModelLoader, Preprocessor, SlotId};
use crate::error::{DispatchError, RejectReason};
use crate::pool::{Lease, WorkerPool};
use crate::queue::TaskQueue;
use crate::task::{Task, TaskHandle, TaskOutcome, TaskPayload};
use crate::worker::{Job, JobError, JobReply, WorkerHandle};

/// Handle to a running dispatcher. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

struct DispatchState {
    queue: TaskQueue,
    pool: WorkerPool,
}

#[derive(Default)]
struct Stats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
    replacements: AtomicU64,
}

impl Stats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TaskCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TaskCounters {
            admitted: get(&self.admitted),
            rejected: get(&self.rejected),
            completed: get(&self.completed),
            failed: get(&self.failed),
            timed_out: get(&self.timed_out),
            abandoned: get(&self.abandoned),
            replacements: get(&self.replacements),
        }
    }
}

struct Shared {
    config: DispatchConfig,
    admission: AdmissionController,
    state: Mutex<DispatchState>,
    loader: Arc<dyn ModelLoader>,
    preprocessor: Arc<dyn Preprocessor>,
    runtime: Handle,
    stats: Stats,
    closed: AtomicBool,
    exhausted: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// How a dispatched task left its worker.
enum Verdict {
    Completed(Fields),
    /// Clean model error; the worker is still usable.
    Failed(String),
    /// The worker thread died or panicked.
    Crashed(String),
    /// The deadline passed while the worker was still running.
    Overran,
}

impl Dispatcher {
    /// Loads every worker and starts the deadline reaper.
    ///
    /// Fails if any worker cannot load its model; no partial pool is kept.
    pub async fn start(
        config: DispatchConfig,
        loader: Arc<dyn ModelLoader>,
        preprocessor: Arc<dyn Preprocessor>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        for warning in config.warnings() {
            warn!("{warning}");
        }

        let started = Instant::now();
        let mut workers = Vec::with_capacity(config.pool_size);
        let mut readies = Vec::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            let slot = SlotId(i);
            let (worker, ready) =
                WorkerHandle::spawn(slot, 0, Arc::clone(&loader), config.memory_optimization)
                    .map_err(|e| DispatchError::Startup(format!("{slot}: {e}")))?;
            workers.push(worker);
            readies.push((slot, ready));
        }

        let mut first_error = None;
        for (slot, ready) in readies {
            let err = match ready.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => "worker thread exited during load".to_string(),
            };
            error!(%slot, error = %err, "worker failed to load");
            first_error.get_or_insert(format!("{slot}: {err}"));
        }
        if let Some(err) = first_error {
            return Err(DispatchError::Startup(err));
        }

        let shared = Arc::new(Shared {
            admission: AdmissionController::new(config.admission_ceiling),
            state: Mutex::new(DispatchState {
                queue: TaskQueue::new(config.max_queue_depth),
                pool: WorkerPool::new(workers),
            }),
            loader,
            preprocessor,
            runtime: Handle::current(),
            stats: Stats::default(),
            closed: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            reaper: Mutex::new(None),
            config,
        });

        let reaper = shared
            .runtime
            .spawn(reap(Arc::downgrade(&shared), shared.config.reap_interval()));
        *shared.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        info!(
            pool_size = shared.config.pool_size,
            max_queue_depth = shared.config.max_queue_depth,
            admission_ceiling = shared.config.admission_ceiling,
            task_timeout_ms = shared.config.task_timeout_ms,
            load_ms = started.elapsed().as_millis() as u64,
            "dispatcher started"
        );
        Ok(Self { shared })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    /// Admits and enqueues one task without blocking.
    ///
    /// A rejection leaves no trace beyond the `rejected` counter. `max_wait`
    /// can only shorten the configured task timeout.
    pub fn submit(
        &self,
        payload: TaskPayload,
        max_wait: Option<Duration>,
    ) -> Result<TaskHandle, DispatchError> {
        let shared = &self.shared;
        shared.check_open()?;

        let permit = match shared.admission.try_admit() {
            Admission::Accepted(permit) => permit,
            Admission::Rejected(reason) => return Err(shared.reject(reason)),
        };

        let now = Instant::now();
        let deadline = now + shared.config.effective_timeout(max_wait);
        let (task, rx) = Task::new(payload, now, deadline, permit);
        let id = task.id;
        {
            let mut state = shared.lock();
            shared.check_open()?;
            if let Err(task) = state.queue.enqueue(task) {
                drop(state);
                drop(task);
                return Err(shared.reject(RejectReason::QueueFull));
            }
            Stats::bump(&shared.stats.admitted);
        }
        debug!(task_id = %id, "task admitted");

        shared.pump();
        Ok(TaskHandle::new(
            id,
            deadline,
            deadline + shared.config.result_margin(),
            rx,
        ))
    }

    /// Runs the preprocessor off the async threads.
    pub async fn preprocess(&self, raw: Vec<u8>) -> Result<NormalizedImage, DispatchError> {
        let preprocessor = Arc::clone(&self.shared.preprocessor);
        tokio::task::spawn_blocking(move || preprocessor.preprocess(&raw))
            .await
            .map_err(|e| DispatchError::InvalidImage(format!("preprocessing aborted: {e}")))?
            .map_err(|e| DispatchError::InvalidImage(e.0))
    }

    /// Preprocess, submit, and wait: the whole request path in one call.
    ///
    /// Invalid input is refused before admission, so it never occupies a
    /// queue slot or a worker.
    pub async fn recognize(
        &self,
        raw: Vec<u8>,
        mode: RecognitionMode,
        max_wait: Option<Duration>,
    ) -> TaskOutcome {
        let image = match self.preprocess(raw).await {
            Ok(image) => image,
            Err(e) => return e.into(),
        };
        match self.submit(TaskPayload { image, mode }, max_wait) {
            Ok(handle) => handle.await_result().await,
            Err(e) => e.into(),
        }
    }

    pub fn stats(&self) -> PoolSnapshot {
        let shared = &self.shared;
        let state = shared.lock();
        let counts = state.pool.counts();
        PoolSnapshot {
            pool_size: state.pool.size(),
            idle: counts.idle,
            busy: counts.busy,
            failed: counts.failed,
            stopped: counts.stopped,
            queue_depth: state.queue.len(),
            max_queue_depth: shared.config.max_queue_depth,
            in_flight: shared.admission.in_flight(),
            admission_ceiling: shared.admission.ceiling(),
            exhausted: shared.exhausted.load(Ordering::Acquire),
            counters: shared.stats.snapshot(),
        }
    }

    /// True while the dispatcher can still run tasks.
    pub fn is_available(&self) -> bool {
        self.shared.check_open().is_ok()
    }

    /// Stops accepting work, fails every queued task, and waits for worker
    /// threads to finish their current call. Idempotent.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reaper) = shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.abort();
        }

        let (queued, workers) = {
            let mut state = shared.lock();
            (state.queue.drain(), state.pool.shutdown())
        };
        info!(
            queued = queued.len(),
            workers = workers.len(),
            "dispatcher shutting down"
        );
        for task in queued {
            shared.deliver(
                task,
                TaskOutcome::Unavailable(DispatchError::ShuttingDown.to_string()),
            );
        }

        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                let slot = worker.slot();
                if worker.join().is_err() {
                    warn!(%slot, "worker thread panicked during shutdown");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "joining workers failed");
        }
        info!("dispatcher stopped");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }
        if self.exhausted.load(Ordering::Acquire) {
            return Err(DispatchError::PoolExhausted);
        }
        Ok(())
    }

    fn reject(&self, reason: RejectReason) -> DispatchError {
        Stats::bump(&self.stats.rejected);
        debug!(%reason, "task rejected");
        DispatchError::Overloaded(reason)
    }

    /// Expires and drops dead queued tasks, then pairs the queue head with
    /// idle workers until one side runs out.
    fn pump(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        let (expired, abandoned, assigned) = {
            let mut state = self.lock();
            let expired = state.queue.remove_expired(now);
            let abandoned = state.queue.remove_abandoned();
            let mut assigned = Vec::new();
            while !state.queue.is_empty() {
                let Some(lease) = state.pool.acquire_idle() else {
                    break;
                };
                let Some(task) = state.queue.pop_front() else {
                    state.pool.release(lease.slot, lease.generation);
                    break;
                };
                assigned.push((lease, task));
            }
            (expired, abandoned, assigned)
        };

        for task in expired {
            warn!(task_id = %task.id, "task expired while queued");
            self.deliver(task, TaskOutcome::Timeout);
        }
        for task in abandoned {
            info!(task_id = %task.id, "queued task abandoned by caller");
            Stats::bump(&self.stats.abandoned);
        }
        for (lease, task) in assigned {
            let shared = Arc::clone(self);
            self.runtime.spawn(shared.execute(lease, task));
        }
    }

    async fn execute(self: Arc<Self>, lease: Lease, task: Task) {
        let Lease {
            slot,
            generation,
            jobs,
        } = lease;
        if Instant::now() >= task.deadline {
            drop(jobs);
            warn!(task_id = %task.id, %slot, "deadline passed before dispatch");
            self.lock().pool.release(slot, generation);
            self.deliver(task, TaskOutcome::Timeout);
            self.pump();
            return;
        }

        let (reply, rx) = oneshot::channel();
        let job = Job {
            task_id: task.id,
            image: task.payload.image.clone(),
            mode: task.payload.mode,
            reply,
        };
        debug!(
            task_id = %task.id,
            %slot,
            queued_ms = task.submitted_at.elapsed().as_millis() as u64,
            "task assigned"
        );

        let sent = jobs.send(job);
        drop(jobs);
        let mut worker_exited = false;
        let verdict = if sent.is_err() {
            Verdict::Crashed("worker thread is gone".to_string())
        } else {
            tokio::select! {
                biased;
                _ = sleep_until(task.deadline) => Verdict::Overran,
                reply = rx => match reply {
                    // A late reply is discarded even when the timer lost the race.
                    _ if Instant::now() >= task.deadline => Verdict::Overran,
                    Ok(JobReply { result, exited }) => {
                        worker_exited = exited;
                        match result {
                            Ok(fields) => Verdict::Completed(fields),
                            Err(JobError::Recognition(msg)) => Verdict::Failed(msg),
                            Err(JobError::Crashed(msg)) => Verdict::Crashed(msg),
                        }
                    }
                    Err(_) => Verdict::Crashed("worker exited without replying".to_string()),
                },
            }
        };
        self.settle(slot, generation, task, verdict, worker_exited);
    }

    fn settle(
        self: &Arc<Self>,
        slot: SlotId,
        generation: u64,
        task: Task,
        verdict: Verdict,
        worker_exited: bool,
    ) {
        let (quarantine, outcome) = match verdict {
            Verdict::Completed(fields) => (false, TaskOutcome::Success(fields)),
            Verdict::Failed(msg) => (self.config.quarantine_on_error, TaskOutcome::Failure(msg)),
            Verdict::Crashed(msg) => {
                error!(task_id = %task.id, %slot, error = %msg, "worker crashed");
                (true, TaskOutcome::Failure(format!("worker crashed: {msg}")))
            }
            Verdict::Overran => {
                warn!(task_id = %task.id, %slot, "task overran its deadline");
                (true, TaskOutcome::Timeout)
            }
        };
        if worker_exited && !quarantine {
            warn!(task_id = %task.id, %slot, "worker exited after replying");
        }
        let quarantine = quarantine || worker_exited;

        let replacement = {
            let mut state = self.lock();
            if quarantine {
                state.pool.quarantine(slot, generation)
            } else {
                state.pool.release(slot, generation);
                None
            }
        };
        if let Some(next_generation) = replacement {
            let shared = Arc::clone(self);
            self.runtime
                .spawn(shared.replace(slot, next_generation));
        }

        self.deliver(task, outcome);
        self.pump();
    }

    /// Releases the task's in-flight slot and hands the outcome to its caller.
    fn deliver(&self, task: Task, outcome: TaskOutcome) {
        let id = task.id;
        let counter = match &outcome {
            TaskOutcome::Success(_) => &self.stats.completed,
            TaskOutcome::Timeout => &self.stats.timed_out,
            _ => &self.stats.failed,
        };
        if task.resolve(outcome) {
            Stats::bump(counter);
        } else {
            info!(task_id = %id, "caller gone; result discarded");
            Stats::bump(&self.stats.abandoned);
        }
    }

    /// Starts a fresh worker for a quarantined slot, retrying with linear
    /// backoff.
    async fn replace(self: Arc<Self>, slot: SlotId, generation: u64) {
        let attempts = self.config.replacement_attempts;
        for attempt in 1..=attempts {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            match self.load_worker(slot, generation).await {
                Ok(worker) => {
                    let installed = self.lock().pool.install(worker);
                    match installed {
                        Ok(()) => {
                            Stats::bump(&self.stats.replacements);
                            info!(%slot, generation, attempt, "replacement worker installed");
                            self.pump();
                        }
                        Err(worker) => worker.retire(),
                    }
                    return;
                }
                Err(e) => {
                    warn!(%slot, attempt, attempts, error = %e, "replacement worker failed to load");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.replacement_backoff() * attempt).await;
                    }
                }
            }
        }
        self.give_up(slot);
    }

    async fn load_worker(&self, slot: SlotId, generation: u64) -> Result<WorkerHandle, String> {
        let (worker, ready) = WorkerHandle::spawn(
            slot,
            generation,
            Arc::clone(&self.loader),
            self.config.memory_optimization,
        )
        .map_err(|e| e.to_string())?;
        match ready.await {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(e)) => Err(e),
            Err(_) => Err("worker thread exited during load".to_string()),
        }
    }

    /// Writes off a slot. If that leaves no worker at all, the pool is
    /// exhausted: queued tasks fail and new submissions are refused.
    fn give_up(&self, slot: SlotId) {
        let queued = {
            let mut state = self.lock();
            state.pool.abandon_replacement(slot);
            if self.closed.load(Ordering::Acquire) || !state.pool.is_exhausted() {
                error!(%slot, "worker slot written off after repeated load failures");
                return;
            }
            self.exhausted.store(true, Ordering::Release);
            state.queue.drain()
        };
        error!(
            pool_size = self.config.pool_size,
            queued = queued.len(),
            "worker pool exhausted; recognition unavailable"
        );
        for task in queued {
            self.deliver(
                task,
                TaskOutcome::Unavailable(DispatchError::PoolExhausted.to_string()),
            );
        }
    }
}

async fn reap(shared: Weak<Shared>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        shared.pump();
    }
}
