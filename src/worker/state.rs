//! Worker slot state machine.

use serde::{Deserialize, Serialize};

/// State of a single worker slot.
///
/// `Idle → Claiming → Executing → Resolving → (Claiming | Idle)`, and
/// `→ ShuttingDown → Stopped` once cancellation is observed at an iteration
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting for the next poll tick or a new-work notification.
    Idle,
    /// Looking for a job and racing other workers for it.
    Claiming,
    /// Running a task handler.
    Executing,
    /// Writing the outcome back to the store.
    Resolving,
    /// Cancellation seen; no further claims.
    ShuttingDown,
    /// Slot loop has exited.
    Stopped,
}

impl SlotState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SlotState) -> bool {
        use SlotState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Claiming) | (Idle, ShuttingDown) |
            // From Claiming (nothing claimable → Idle)
            (Claiming, Executing) | (Claiming, Idle) | (Claiming, ShuttingDown) |
            (Executing, Resolving) |
            // A slot that just finished a job claims again without idling
            (Resolving, Claiming) | (Resolving, Idle) | (Resolving, ShuttingDown) |
            (ShuttingDown, Stopped)
        )
    }

    /// Whether the slot currently owns a job.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Executing | Self::Resolving)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Executing => "executing",
            Self::Resolving => "resolving",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
