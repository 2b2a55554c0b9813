//! `welcome_email` task — sends the post-registration greeting.
//!
//! Delivery is simulated with a fixed delay; the handler's real job here is
//! payload validation, so malformed registrations fail fast instead of being
//! retried.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::tasks::registry::{TaskContext, TaskHandler};

pub const TASK_NAME: &str = "welcome_email";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid")
});

/// Payload accepted by the task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeEmail {
    pub user_id: Uuid,
    pub email: String,
}

impl WelcomeEmail {
    pub fn parse(payload: serde_json::Value) -> Result<Self, HandlerError> {
        let data: Self = serde_json::from_value(payload)?;
        if !EMAIL_RE.is_match(&data.email) {
            return Err(HandlerError::fatal(format!(
                "Invalid payload: {:?} is not an email address",
                data.email
            )));
        }
        Ok(data)
    }
}

/// Handler for [`TASK_NAME`].
pub struct WelcomeEmailTask {
    send_delay: Duration,
}

impl WelcomeEmailTask {
    pub fn new(send_delay: Duration) -> Self {
        Self { send_delay }
    }
}

impl Default for WelcomeEmailTask {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl TaskHandler for WelcomeEmailTask {
    async fn run(&self, payload: serde_json::Value, ctx: TaskContext) -> Result<(), HandlerError> {
        let data = WelcomeEmail::parse(payload)?;
        tracing::info!(job_id = ctx.job_id, email = %data.email, "Sending welcome email");

        // Sends are short; finish them even while the worker drains.
        tokio::time::sleep(self.send_delay).await;

        tracing::info!(
            job_id = ctx.job_id,
            user_id = %data.user_id,
            email = %data.email,
            "Welcome email sent"
        );
        Ok(())
    }
}
