//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::queue::Backoff;

/// Default location of the local job database.
pub const DEFAULT_DATABASE_URL: &str = "./data/jobq.db";

/// Queue and worker configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Local path, `:memory:`, or a `libsql://` / `https://` URL.
    pub database_url: String,
    /// Auth token for remote databases.
    pub auth_token: Option<SecretString>,
    /// Number of job slots a worker runs concurrently.
    pub concurrency: usize,
    /// How long an idle slot waits before polling again.
    pub poll_interval: Duration,
    /// `max_attempts` given to jobs enqueued without an explicit value.
    pub default_max_attempts: u32,
    /// Retry delay policy.
    pub backoff: Backoff,
    /// Locks older than this are considered abandoned by the recovery sweep.
    pub stale_lock_after: Duration,
    /// Interval of the periodic recovery sweep (`None` disables it).
    pub recovery_interval: Option<Duration>,
    /// How long in-flight jobs may keep running after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Worker identifier; slots append their index.
    pub worker_id: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            auth_token: None,
            concurrency: 5,
            poll_interval: Duration::from_millis(2000),
            default_max_attempts: 5,
            backoff: Backoff::default(),
            stale_lock_after: Duration::from_secs(4 * 3600), // 4 hours
            recovery_interval: Some(Duration::from_secs(300)), // 5 minutes
            shutdown_grace: Duration::from_secs(10),
            worker_id: generate_worker_id(),
        }
    }
}

impl QueueConfig {
    /// In-memory configuration for tests and embedding.
    pub fn in_memory() -> Self {
        Self {
            database_url: ":memory:".to_string(),
            ..Self::default()
        }
    }

    /// Build configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Missing keys fall
    /// back to defaults; present but malformed values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.database_url);
        let auth_token = lookup("DATABASE_AUTH_TOKEN")
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        let concurrency: usize = parse_or(&lookup, "JOBQ_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JOBQ_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }

        let default_max_attempts: u32 =
            parse_or(&lookup, "JOBQ_MAX_ATTEMPTS", defaults.default_max_attempts)?;
        if default_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JOBQ_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        let poll_ms: u64 = parse_or(
            &lookup,
            "JOBQ_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;
        let base_ms: u64 = parse_or(
            &lookup,
            "JOBQ_BACKOFF_BASE_MS",
            defaults.backoff.base.as_millis() as u64,
        )?;
        let cap_ms: u64 = parse_or(
            &lookup,
            "JOBQ_BACKOFF_CAP_MS",
            defaults.backoff.cap.as_millis() as u64,
        )?;
        let stale_secs: u64 = parse_or(
            &lookup,
            "JOBQ_STALE_LOCK_SECS",
            defaults.stale_lock_after.as_secs(),
        )?;
        let recovery_secs: u64 = parse_or(
            &lookup,
            "JOBQ_RECOVERY_INTERVAL_SECS",
            defaults.recovery_interval.map(|d| d.as_secs()).unwrap_or(0),
        )?;
        let grace_secs: u64 = parse_or(
            &lookup,
            "JOBQ_SHUTDOWN_GRACE_SECS",
            defaults.shutdown_grace.as_secs(),
        )?;

        let worker_id = lookup("JOBQ_WORKER_ID")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.worker_id);

        Ok(Self {
            database_url,
            auth_token,
            concurrency,
            poll_interval: Duration::from_millis(poll_ms),
            default_max_attempts,
            backoff: Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms)),
            stale_lock_after: Duration::from_secs(stale_secs),
            recovery_interval: (recovery_secs > 0).then(|| Duration::from_secs(recovery_secs)),
            shutdown_grace: Duration::from_secs(grace_secs),
            worker_id,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        }
        _ => Ok(default),
    }
}

/// Random worker identifier in the `worker-<hex>` form.
pub fn generate_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..12])
}
