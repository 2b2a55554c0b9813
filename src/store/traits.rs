//! `JobStore` trait — the single async interface to durable job state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::queue::{Job, JobId, NewJob, QueueStats};

/// Backend-agnostic job store.
///
/// Every mutating method is one conditional statement against a single row
/// (or set of rows), so concurrent callers never interleave within an update.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Insert a pending job and return its id.
    ///
    /// Fails with `DuplicateJob` when `job_key` is already taken.
    async fn insert(&self, job: &NewJob) -> Result<JobId, StoreError>;

    /// Fetch a job by id.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Up to `limit` claimable jobs, oldest `run_at` (then `created_at`) first.
    async fn find_claimable(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Atomically lock an eligible job for `worker_id`, incrementing `attempts`.
    ///
    /// Returns `None` when another worker got there first or the job is no
    /// longer eligible; losing a race is not an error.
    async fn try_claim(&self, id: JobId, worker_id: &str) -> Result<Option<Job>, StoreError>;

    /// Mark a job held by `worker_id` as completed.
    /// Returns `false` when the caller no longer holds the lock.
    async fn resolve_success(&self, id: JobId, worker_id: &str) -> Result<bool, StoreError>;

    /// Release the lock, record the error and reschedule for `next_run_at`.
    async fn resolve_retry(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Mark a job held by `worker_id` as permanently failed.
    async fn resolve_failure(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// Clear locks older than `older_than`. Jobs whose attempts are already
    /// exhausted are failed instead of returned to pending.
    /// Returns the number of jobs released or failed.
    async fn release_stale_locks(&self, older_than: Duration) -> Result<u64, StoreError>;

    /// Queue-wide counts computed from one snapshot.
    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Delete completed jobs finished more than `older_than` ago.
    async fn purge_completed(&self, older_than: Duration) -> Result<u64, StoreError>;
}
