//! Worker pool — claim, execute, resolve.
//!
//! A `Worker` runs `concurrency` independent slots. Each slot polls the
//! store, claims one job at a time through the store's conditional update,
//! dispatches it to the task registry and writes the outcome back. Store
//! errors never end a slot; they are logged and the slot polls again.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{HandlerError, StoreError, TaskError};
use crate::queue::{Backoff, Job, JobId, JobQueue};
use crate::tasks::{TaskContext, TaskRegistry};
use crate::worker::state::SlotState;

/// Writes of a job outcome before the job is left to lock recovery.
const RESOLVE_ATTEMPTS: u32 = 4;

/// Base pause between outcome writes; grows linearly per attempt.
const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tunables for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub backoff: Backoff,
    pub shutdown_grace: Duration,
}

impl WorkerOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval,
            backoff: config.backoff,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Why an execution did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    UnknownTask(#[from] TaskError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// What happens to a job after an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Complete,
    Retry {
        error: String,
        next_run_at: DateTime<Utc>,
    },
    Fail {
        error: String,
    },
}

impl Resolution {
    /// Classify an execution result for a claimed job.
    ///
    /// `job.attempts` already includes the execution being resolved.
    pub fn decide(
        job: &Job,
        result: Result<(), ExecutionError>,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Self {
        match result {
            Ok(()) => Self::Complete,
            Err(ExecutionError::UnknownTask(e)) => Self::Fail {
                error: e.to_string(),
            },
            Err(ExecutionError::Handler(e)) if e.fatal || !job.has_attempts_left() => Self::Fail {
                error: e.message,
            },
            Err(ExecutionError::Handler(e)) => Self::Retry {
                error: e.message,
                next_run_at: backoff.next_run_at(job.attempts, now),
            },
        }
    }
}

/// Per-worker outcome counts, returned when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    /// Slots still executing when the grace period ran out.
    pub abandoned: usize,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// State shared by every slot of one worker.
struct Shared {
    queue: Arc<JobQueue>,
    registry: Arc<TaskRegistry>,
    options: WorkerOptions,
    stop: CancellationToken,
    counters: Counters,
}

/// A pool of job slots bound to one queue and one task registry.
pub struct Worker {
    queue: Arc<JobQueue>,
    registry: Arc<TaskRegistry>,
    options: WorkerOptions,
}

impl Worker {
    /// Create a worker using the queue's configuration.
    pub fn new(queue: Arc<JobQueue>, registry: Arc<TaskRegistry>) -> Self {
        let options = WorkerOptions::from_config(queue.config());
        Self {
            queue,
            registry,
            options,
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Run in a background task; stop it through the returned handle.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.options.concurrency.max(1))
            .map(|_| watch::channel(SlotState::Idle))
            .unzip();
        let task = tokio::spawn(self.run_slots(shutdown.clone(), senders));
        WorkerHandle {
            shutdown,
            slots: receivers,
            task,
        }
    }

    /// Run until `shutdown` fires, then drain in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) -> WorkerSummary {
        let senders = (0..self.options.concurrency.max(1))
            .map(|_| watch::channel(SlotState::Idle).0)
            .collect();
        self.run_slots(shutdown, senders).await
    }

    async fn run_slots(
        self,
        shutdown: CancellationToken,
        senders: Vec<watch::Sender<SlotState>>,
    ) -> WorkerSummary {
        let shared = Arc::new(Shared {
            queue: self.queue,
            registry: self.registry,
            options: self.options,
            stop: shutdown,
            counters: Counters::default(),
        });

        if shared.registry.is_empty() {
            warn!(worker = %shared.options.worker_id, "No task handlers registered; every claimed job will fail");
        }
        info!(
            worker = %shared.options.worker_id,
            concurrency = senders.len(),
            poll_interval_ms = shared.options.poll_interval.as_millis() as u64,
            tasks = ?shared.registry.names(),
            "Worker started"
        );

        let watchers: Vec<_> = senders.iter().map(|tx| tx.subscribe()).collect();
        let mut slots = JoinSet::new();
        for (index, state) in senders.into_iter().enumerate() {
            let slot = Slot {
                id: format!("{}-{}", shared.options.worker_id, index),
                shared: Arc::clone(&shared),
                state,
            };
            slots.spawn(slot.run());
        }

        shared.stop.cancelled().await;
        let in_flight = watchers.iter().filter(|rx| rx.borrow().is_busy()).count();
        info!(
            worker = %shared.options.worker_id,
            in_flight,
            grace_secs = shared.options.shutdown_grace.as_secs_f64(),
            "Shutdown requested, draining in-flight jobs"
        );

        let drained = tokio::time::timeout(shared.options.shutdown_grace, async {
            while let Some(res) = slots.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "Worker slot panicked");
                }
            }
        })
        .await;

        let abandoned = if drained.is_err() {
            let remaining = slots.len();
            warn!(
                worker = %shared.options.worker_id,
                remaining,
                "Grace period expired; abandoning in-flight jobs (they stay locked until lock recovery)"
            );
            slots.shutdown().await;
            remaining
        } else {
            0
        };

        let summary = WorkerSummary {
            completed: shared.counters.completed.load(Ordering::Relaxed),
            retried: shared.counters.retried.load(Ordering::Relaxed),
            failed: shared.counters.failed.load(Ordering::Relaxed),
            abandoned,
        };
        info!(worker = %shared.options.worker_id, ?summary, "Worker stopped");
        summary
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    slots: Vec<watch::Receiver<SlotState>>,
    task: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    /// Current state of every slot.
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(|rx| *rx.borrow()).collect()
    }

    /// Token that stops the worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until some slot reaches `state`.
    ///
    /// Returns `false` if every slot stopped without reaching it.
    pub async fn wait_for_state(&self, state: SlotState) -> bool {
        let mut waits: Vec<_> = self
            .slots
            .iter()
            .cloned()
            .map(|mut rx| Box::pin(async move { rx.wait_for(|s| *s == state).await.is_ok() }))
            .collect();

        while !waits.is_empty() {
            let (reached, _, rest) = futures::future::select_all(waits).await;
            if reached {
                return true;
            }
            waits = rest;
        }
        false
    }

    /// Request shutdown and wait for the drain to finish.
    pub async fn shutdown(self) -> WorkerSummary {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the worker to stop (after its token is cancelled elsewhere).
    pub async fn join(self) -> WorkerSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Worker task failed");
                WorkerSummary::default()
            }
        }
    }
}

/// One claim/execute/resolve loop.
struct Slot {
    id: String,
    shared: Arc<Shared>,
    state: watch::Sender<SlotState>,
}

impl Slot {
    async fn run(self) {
        let shared = Arc::clone(&self.shared);
        // A slot that just resolved a job claims again without waiting.
        let mut wait = false;
        debug!(slot = %self.id, "Worker slot started");

        loop {
            if shared.stop.is_cancelled() {
                break;
            }

            if wait {
                self.set(SlotState::Idle);
                tokio::select! {
                    biased;
                    _ = shared.stop.cancelled() => break,
                    _ = shared.queue.new_work().notified() => {}
                    _ = tokio::time::sleep(shared.options.poll_interval) => {}
                }
            }

            self.set(SlotState::Claiming);
            let job = match self.claim().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    wait = true;
                    continue;
                }
                Err(e) => {
                    warn!(slot = %self.id, error = %e, "Claim failed");
                    wait = true;
                    continue;
                }
            };

            self.set(SlotState::Executing);
            let result = self.execute(&job).await;
            self.set(SlotState::Resolving);
            self.resolve(&job, result).await;
            wait = false;
        }

        self.set(SlotState::ShuttingDown);
        self.set(SlotState::Stopped);
        debug!(slot = %self.id, "Worker slot stopped");
    }

    fn set(&self, next: SlotState) {
        let current = *self.state.borrow();
        debug_assert!(
            current.can_transition_to(next),
            "invalid slot transition {current} -> {next}"
        );
        self.state.send_replace(next);
    }

    /// Find candidates and race for them oldest-first.
    async fn claim(&self) -> Result<Option<Job>, StoreError> {
        let store = self.shared.queue.store();
        let limit = self.shared.options.concurrency.max(1);

        loop {
            let candidates = store.find_claimable(limit).await?;
            let full_batch = candidates.len() == limit;

            for candidate in candidates {
                if let Some(job) = store.try_claim(candidate.id, &self.id).await? {
                    return Ok(Some(job));
                }
                debug!(slot = %self.id, job_id = candidate.id, "Job already taken");
            }

            // Every candidate went to someone else; look again only if
            // there may be more eligible jobs behind them.
            if !full_batch {
                return Ok(None);
            }
        }
    }

    async fn execute(&self, job: &Job) -> Result<(), ExecutionError> {
        let handler = self.shared.registry.get(&job.task_name)?;
        let ctx = TaskContext::for_job(job, &self.id, self.shared.stop.clone());

        info!(
            slot = %self.id,
            job_id = job.id,
            task = %job.task_name,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Executing job"
        );

        let start = Instant::now();
        let result = AssertUnwindSafe(handler.run(job.payload.clone(), ctx))
            .catch_unwind()
            .await;
        debug!(job_id = job.id, elapsed_ms = start.elapsed().as_millis() as u64, "Handler returned");

        match result {
            Ok(outcome) => outcome.map_err(ExecutionError::from),
            Err(panic) => Err(HandlerError::retryable(format!(
                "Handler panicked: {}",
                panic_message(panic.as_ref())
            ))
            .into()),
        }
    }

    async fn resolve(&self, job: &Job, result: Result<(), ExecutionError>) {
        let resolution =
            Resolution::decide(job, result, &self.shared.options.backoff, Utc::now());
        let counters = &self.shared.counters;

        match self.write_resolution(job.id, &resolution).await {
            Ok(true) => match &resolution {
                Resolution::Complete => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    info!(job_id = job.id, task = %job.task_name, "Job completed");
                }
                Resolution::Retry { error, next_run_at } => {
                    counters.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        job_id = job.id,
                        task = %job.task_name,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        run_at = %next_run_at,
                        error = %error,
                        "Job failed, retry scheduled"
                    );
                }
                Resolution::Fail { error } => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        job_id = job.id,
                        task = %job.task_name,
                        attempts = job.attempts,
                        error = %error,
                        "Job failed permanently"
                    );
                }
            },
            Ok(false) => {
                warn!(
                    slot = %self.id,
                    job_id = job.id,
                    "Lock was released before the outcome was written; outcome discarded"
                );
            }
            Err(e) => {
                error!(
                    slot = %self.id,
                    job_id = job.id,
                    error = %e,
                    "Failed to resolve job; it stays locked until lock recovery"
                );
            }
        }
    }

    /// Write an outcome, retrying `StoreError::Unavailable` up to
    /// `RESOLVE_ATTEMPTS` times.
    async fn write_resolution(
        &self,
        id: JobId,
        resolution: &Resolution,
    ) -> Result<bool, StoreError> {
        let store = self.shared.queue.store();
        let mut attempt = 1;
        loop {
            let written = match resolution {
                Resolution::Complete => store.resolve_success(id, &self.id).await,
                Resolution::Retry { error, next_run_at } => {
                    store.resolve_retry(id, &self.id, error, *next_run_at).await
                }
                Resolution::Fail { error } => store.resolve_failure(id, &self.id, error).await,
            };

            match written {
                Err(StoreError::Unavailable(e)) if attempt < RESOLVE_ATTEMPTS => {
                    warn!(slot = %self.id, job_id = id, attempt, "Resolve failed, retrying: {}", e);
                    tokio::time::sleep(RESOLVE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
