//! Built-in task handlers.

use std::sync::Arc;

use crate::tasks::TaskRegistry;

pub mod welcome_email;

pub use welcome_email::WelcomeEmailTask;

/// Register every built-in handler with its default settings.
pub fn register_all(registry: &mut TaskRegistry) -> crate::error::Result<()> {
    registry.register(welcome_email::TASK_NAME, Arc::new(WelcomeEmailTask::default()))?;
    Ok(())
}
