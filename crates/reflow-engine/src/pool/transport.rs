//! Transport seam between the pool and its workers.
//!
//! The pool only ever sees typed channels; how a worker comes to exist
//! behind them is the launcher's business. Production uses
//! [`super::process::ProcessLauncher`]; tests drive the pool with an
//! in-process launcher.

use std::path::PathBuf;

use async_trait::async_trait;
use reflow_proto::{PoolMessage, WorkerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::PoolError;

/// Descriptor a worker is started with: which task module it serves and
/// where the shared payload spool lives.
#[derive(Debug, Clone)]
pub struct WorkerParameters {
    /// Name of the task module whose functions the worker may execute.
    pub task_module: String,

    /// Spool directory shared with the pool's payload channel.
    pub spool_dir: PathBuf,
}

/// A live worker, reduced to its message channels.
pub struct WorkerChannel {
    /// OS pid, when the transport has one.
    pub pid: Option<u32>,

    /// Pool → worker task stream. Dropping it signals graceful shutdown.
    pub tx: mpsc::Sender<PoolMessage>,

    /// Worker → pool message stream. `None` from `recv` means the worker
    /// is gone.
    pub rx: mpsc::Receiver<WorkerMessage>,

    /// Hard-kill trigger; fired on interrupt, never on graceful shutdown.
    pub kill: Option<oneshot::Sender<()>>,

    /// Completes once the worker has fully exited. `None` when the
    /// transport cannot observe exit.
    pub exit: Option<JoinHandle<()>>,
}

/// Starts workers for the pool.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch one worker. The returned channel must eventually yield an
    /// `Initialization` frame; the pool enforces the deadline.
    async fn launch(&self, params: &WorkerParameters) -> Result<WorkerChannel, PoolError>;
}
