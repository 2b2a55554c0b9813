//! Task handlers and the registry that dispatches to them.

pub mod builtin;
pub mod registry;

pub use registry::{TaskContext, TaskHandler, TaskRegistry};
