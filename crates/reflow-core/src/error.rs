//! Errors that cross the process boundary or fan out to multiple awaiters.
//!
//! Component-local errors (registry, cache, lock, pool) live next to their
//! components in `reflow-engine`. The types here are shared: they travel
//! over the wire or are cloned into every observer of a task outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error payload carried across the process boundary.
///
/// The worker never ships an exception type to the pool - only the textual
/// message and a stack-trace-like diagnostic string. The receiving side
/// wraps it in [`TaskError::Failed`] instead of reconstructing the original
/// error class.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    /// Human-readable error message.
    pub message: String,

    /// Stack-trace-like diagnostic string, best effort.
    pub trace: String,
}

impl RemoteError {
    /// Create a new RemoteError.
    pub fn new(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Build a RemoteError from any error value, using its `Display` as the
    /// message and its `Debug` rendering as the trace.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self {
            message: err.to_string(),
            trace: format!("{err:?}"),
        }
    }
}

/// Terminal outcome error for a submitted task.
///
/// Cloneable so a single task outcome can be observed by every awaiter of
/// the same ticket.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// The task function failed inside the worker. Delivered only to the
    /// awaiting callers of that specific task.
    #[error("task failed in worker: {0}")]
    Failed(RemoteError),

    /// The owning worker crashed outside the task protocol. The pool
    /// respawns the worker; the task is not retried automatically.
    #[error("worker fault: {0}")]
    WorkerFault(String),

    /// The await was cancelled (hard shutdown or explicit cancel).
    #[error("task cancelled")]
    Cancelled,
}
