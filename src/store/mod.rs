//! Persistence layer — libSQL-backed durable job store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlJobStore;
pub use traits::JobStore;
