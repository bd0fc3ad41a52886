//! Lifecycle state enums for the pool and its workers.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the task pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolState {
    /// Pool constructed but workers not yet started.
    #[default]
    Created,
    /// Pool accepting submissions and dispatching work.
    Running,
    /// Pool no longer accepting submissions; in-flight tasks drain.
    Closed,
    /// All worker processes have exited.
    Stopped,
    /// Pool failed; reachable from any state.
    Error,
}

impl PoolState {
    /// Returns true if the pool accepts new submissions.
    pub fn accepts_submissions(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the pool is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// Lifecycle state of a single worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Worker spawned but not yet initialized.
    #[default]
    Created,
    /// Worker initialized and waiting for a task.
    Idle,
    /// Worker executing a task. Exactly one worker owns a task while here.
    Working,
    /// Worker process exited cleanly.
    Stopped,
    /// Worker crashed or violated the protocol.
    Error,
}

impl WorkerState {
    /// Returns true if the worker can be handed a task.
    pub fn can_accept_task(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the worker is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}
