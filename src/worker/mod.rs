//! Worker system — job execution with lock recovery.
//!
//! Core components:
//! - `state` — Slot state machine (Idle → Claiming → Executing → Resolving)
//! - `worker` — Slot pool: claim, dispatch to the task registry, resolve, drain
//! - `recovery` — Periodic release of stale locks

pub mod recovery;
pub mod state;
pub mod worker;

pub use recovery::spawn_lock_recovery;
pub use state::SlotState;
pub use worker::{Resolution, Worker, WorkerHandle, WorkerOptions, WorkerSummary};
