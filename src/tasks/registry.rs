//! Task registry — maps task names to handlers.
//!
//! The registry is built mutably at startup and then frozen behind an `Arc`
//! before any worker starts, so lookups never race with registration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, TaskError};
use crate::queue::{Job, JobId};

/// What a handler knows about the job it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: JobId,
    pub task_name: String,
    /// Attempt number of this execution (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker_id: String,
    /// Fires when the worker is shutting down; long handlers should stop early.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn for_job(job: &Job, worker_id: &str, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            task_name: job.task_name.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            worker_id: worker_id.to_string(),
            cancel,
        }
    }
}

/// A unit of work executable by a worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, payload: serde_json::Value, ctx: TaskContext) -> Result<(), HandlerError>;
}

/// Adapter so plain async closures can be registered as handlers.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn run(&self, payload: serde_json::Value, ctx: TaskContext) -> Result<(), HandlerError> {
        (self.0)(payload, ctx).await
    }
}

/// Registry of task handlers.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Names are unique.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), TaskError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(TaskError::AlreadyRegistered { name });
        }
        tracing::debug!("Registered task: {}", name);
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<(), TaskError>
    where
        F: Fn(serde_json::Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)))
    }

    /// Get a handler by task name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn TaskHandler>, TaskError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask {
                name: name.to_string(),
            })
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
