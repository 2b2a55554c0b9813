//! jobq — persistent background job queue.

pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod tasks;
pub mod worker;
