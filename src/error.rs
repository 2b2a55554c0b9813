//! Error types for jobq.

/// Top-level error type for the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or the statement failed. No job state
    /// was changed by the failing operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("A job with key {key:?} already exists")]
    DuplicateJob { key: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("No handler registered for task {name:?}")]
    UnknownTask { name: String },

    #[error("Task {name:?} is already registered")]
    AlreadyRegistered { name: String },
}

/// Failure reported by a task handler.
///
/// Handler failures are recoverable unless the handler marks them fatal;
/// a fatal failure moves the job straight to `failed` without further retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub fatal: bool,
}

impl HandlerError {
    /// A failure worth retrying after backoff.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// A failure that no amount of retrying will fix (bad payload, etc).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::fatal(format!("Invalid payload: {e}"))
    }
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
