//! Job records and their lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned, monotonically increasing job identifier.
pub type JobId = i64;

/// Lifecycle state of a job, derived from its lock and terminal markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker (possibly delayed by `run_at`).
    Pending,
    /// Claimed by a worker.
    Locked,
    /// Handler succeeded.
    Completed,
    /// Attempts exhausted or a fatal error.
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub job_key: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn state(&self) -> JobState {
        if self.completed_at.is_some() {
            JobState::Completed
        } else if self.failed_at.is_some() {
            JobState::Failed
        } else if self.locked_by.is_some() {
            JobState::Locked
        } else {
            JobState::Pending
        }
    }

    /// Whether another failing attempt would be allowed.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    /// Attempt ceiling; the queue default applies when absent.
    pub max_attempts: Option<u32>,
    /// Earliest time the job may run; now when absent.
    pub run_at: Option<DateTime<Utc>>,
    /// Idempotency key; a second enqueue with the same key is rejected.
    pub job_key: Option<String>,
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn job_key(mut self, key: impl Into<String>) -> Self {
        self.job_key = Some(key.into());
        self
    }
}

/// A job ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub task_name: String,
    pub payload: serde_json::Value,
    pub job_key: Option<String>,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    /// A job runnable immediately with the given attempt ceiling.
    pub fn new(task_name: impl Into<String>, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            task_name: task_name.into(),
            payload,
            job_key: None,
            max_attempts: max_attempts.max(1),
            run_at: Utc::now(),
        }
    }

    /// Apply enqueue options on top of a default attempt ceiling.
    pub fn from_options(
        task_name: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
        default_max_attempts: u32,
    ) -> Self {
        let mut job = Self::new(
            task_name,
            payload,
            options.max_attempts.unwrap_or(default_max_attempts),
        );
        job.job_key = options.job_key;
        if let Some(at) = options.run_at {
            job.run_at = at;
        }
        job
    }
}
