//! Queue statistics snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::JobId;

/// Queue-wide counts plus per-task and per-worker breakdowns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub locked: u64,
    pub failed: u64,
    pub completed: u64,
    pub total: u64,
    /// Pending jobs that already failed at least once.
    pub retrying: u64,
    pub task_stats: Vec<TaskStats>,
    pub active_jobs: Vec<ActiveJob>,
    pub workers: Vec<WorkerLoad>,
}

/// Counts for a single task name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub task_name: String,
    pub pending: u64,
    pub locked: u64,
    pub failed: u64,
    pub completed: u64,
}

/// A job currently held by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub id: JobId,
    pub task_name: String,
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

/// Number of jobs a single worker slot holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLoad {
    pub locked_by: String,
    pub jobs: u64,
}

impl QueueStats {
    /// Assemble a snapshot from per-task rows and the locked jobs.
    ///
    /// Global counts are sums over `task_stats`, so they always agree.
    pub fn from_parts(mut task_stats: Vec<TaskStats>, mut active_jobs: Vec<ActiveJob>, retrying: u64) -> Self {
        let mut stats = Self {
            retrying,
            ..Self::default()
        };
        for t in &task_stats {
            stats.pending += t.pending;
            stats.locked += t.locked;
            stats.failed += t.failed;
            stats.completed += t.completed;
        }
        stats.total = stats.pending + stats.locked + stats.failed + stats.completed;

        task_stats.sort_by(|a, b| {
            b.pending
                .cmp(&a.pending)
                .then_with(|| a.task_name.cmp(&b.task_name))
        });
        active_jobs.sort_by(|a, b| {
            a.locked_by
                .cmp(&b.locked_by)
                .then_with(|| b.id.cmp(&a.id))
        });

        let mut workers: Vec<WorkerLoad> = Vec::new();
        for job in &active_jobs {
            match workers.last_mut() {
                Some(w) if w.locked_by == job.locked_by => w.jobs += 1,
                _ => workers.push(WorkerLoad {
                    locked_by: job.locked_by.clone(),
                    jobs: 1,
                }),
            }
        }
        workers.sort_by(|a, b| b.jobs.cmp(&a.jobs).then_with(|| a.locked_by.cmp(&b.locked_by)));

        stats.task_stats = task_stats;
        stats.active_jobs = active_jobs;
        stats.workers = workers;
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Result of an administrative lock reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetLocksOutcome {
    pub released_count: u64,
}
