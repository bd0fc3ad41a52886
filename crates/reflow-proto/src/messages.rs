//! Typed control-queue messages.
//!
//! One JSON object per line in each direction. Worker→pool frames are
//! tagged unions; the single pool→worker frame is the task assignment.
//! Graceful shutdown is signalled by closing the pool→worker stream, not
//! by a message.

use reflow_core::{RemoteError, TaskUid};
use serde::{Deserialize, Serialize};

use crate::payload::PayloadRef;

/// Message sent from a worker process to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First frame a worker emits once its task module is loaded.
    Initialization {
        worker_pid: u32,
    },

    /// Worker picked up a task and is about to execute it.
    Acknowledgement {
        task_uid: TaskUid,
        worker_pid: u32,
    },

    /// Progress report for a running task. Per-task emission order is
    /// preserved end to end.
    Progress {
        task_uid: TaskUid,
        progress: f64,
        message: String,
    },

    /// Free-form log line, optionally attributed to a task.
    Log {
        #[serde(default)]
        task_uid: Option<TaskUid>,
        line: String,
    },

    /// Task finished; the result was published to the payload channel.
    Result {
        task_uid: TaskUid,
        payload: PayloadRef,
    },

    /// Task-level failure (`task_uid` present) or fatal worker-level fault
    /// (`task_uid` absent).
    Problem {
        #[serde(default)]
        task_uid: Option<TaskUid>,
        error: RemoteError,
    },
}

/// Message sent from the pool to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    /// Assign a task. The payload is fetched through the shared channel.
    WorkerTask {
        task_uid: TaskUid,
        payload: PayloadRef,
    },
}
