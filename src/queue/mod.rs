//! Queue context — the handle producers, workers and operators share.
//!
//! A `JobQueue` owns the store connection and the queue configuration. It is
//! constructed once per process with [`JobQueue::connect`] (or
//! [`JobQueue::with_store`]) and passed around as `Arc<JobQueue>`.

mod backoff;
mod model;
mod stats;

pub use backoff::Backoff;
pub use model::{EnqueueOptions, Job, JobId, JobState, NewJob};
pub use stats::{ActiveJob, QueueStats, ResetLocksOutcome, TaskStats, WorkerLoad};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::store::{JobStore, LibSqlJobStore};

/// Shared queue handle.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    /// Wakes idle worker slots in this process when a job is enqueued.
    new_work: Arc<Notify>,
}

impl JobQueue {
    /// Open the store named by `config.database_url` and run migrations.
    pub async fn connect(config: QueueConfig) -> Result<Self, StoreError> {
        let store =
            LibSqlJobStore::connect(&config.database_url, config.auth_token.as_ref()).await?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Read [`QueueConfig`] from the environment and connect.
    pub async fn from_env() -> crate::error::Result<Self> {
        let config = QueueConfig::from_env()?;
        Ok(Self::connect(config).await?)
    }

    /// Build a queue around an already-open store.
    pub fn with_store(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            new_work: Arc::new(Notify::new()),
        }
    }

    /// In-memory queue with default settings (for tests and embedding).
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect(QueueConfig::in_memory()).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn new_work(&self) -> &Arc<Notify> {
        &self.new_work
    }

    /// Enqueue a job and return its id.
    ///
    /// Safe to call concurrently from any number of producers.
    pub async fn enqueue(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, StoreError> {
        let job = NewJob::from_options(task_name, payload, options, self.config.default_max_attempts);
        let id = self.store.insert(&job).await?;
        info!(job_id = id, task = task_name, max_attempts = job.max_attempts, "Job enqueued");
        self.new_work.notify_waiters();
        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.get_job(id).await
    }

    /// Queue-wide, per-task and per-worker counts.
    pub async fn get_stats(&self) -> Result<QueueStats, StoreError> {
        self.store.stats().await
    }

    /// Administrative override: release every lock, whatever its age.
    ///
    /// Jobs still being run by a live worker may end up processed twice, so
    /// handlers must be idempotent.
    pub async fn reset_stuck_locks(&self) -> Result<ResetLocksOutcome, StoreError> {
        let released_count = self.store.release_stale_locks(Duration::ZERO).await?;
        info!(released_count, "Reset all job locks");
        if released_count > 0 {
            self.new_work.notify_waiters();
        }
        Ok(ResetLocksOutcome { released_count })
    }

    /// Release locks older than `older_than`.
    pub async fn release_stale_locks(&self, older_than: Duration) -> Result<u64, StoreError> {
        let released = self.store.release_stale_locks(older_than).await?;
        if released > 0 {
            self.new_work.notify_waiters();
        }
        Ok(released)
    }

    /// Delete completed jobs older than `older_than`.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<u64, StoreError> {
        self.store.purge_completed(older_than).await
    }

    /// Tear down the queue handle. Workers holding their own `Arc` keep the
    /// store open until they stop.
    pub fn close(self) {
        debug!(database = %self.config.database_url, "Job queue closed");
    }
}
