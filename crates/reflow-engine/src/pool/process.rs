//! Subprocess-backed worker launcher.
//!
//! Spawns the worker binary with piped stdio and bridges the streams to
//! typed channels: one JSON frame per line in each direction, stderr
//! re-emitted through `tracing`. Closing the task stream closes the
//! worker's stdin, which is its graceful-shutdown signal; the kill trigger
//! terminates the process without waiting.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use reflow_proto::{PoolMessage, WorkerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::transport::{WorkerChannel, WorkerLauncher, WorkerParameters};
use super::PoolError;

const CHANNEL_DEPTH: usize = 64;

/// Launches worker processes from a binary on disk.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    /// Create a launcher for the given worker binary (PATH lookup or full
    /// path).
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, params: &WorkerParameters) -> Result<WorkerChannel, PoolError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--task-module")
            .arg(&params.task_module)
            .arg("--spool-dir")
            .arg(&params.spool_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.binary.display(), module = %params.task_module, "Spawning worker");

        let mut child = cmd
            .spawn()
            .map_err(|e| PoolError::WorkerStartup(format!("spawn failed: {e}")))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Transport("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Transport("worker stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PoolError::Transport("worker stderr unavailable".to_string()))?;

        let (pool_tx, pool_rx) = mpsc::channel::<PoolMessage>(CHANNEL_DEPTH);
        let (worker_tx, worker_rx) = mpsc::channel::<WorkerMessage>(CHANNEL_DEPTH);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        spawn_writer(stdin, pool_rx);
        spawn_reader(stdout, worker_tx, pid);
        spawn_stderr_logger(stderr, pid);
        let reaper = spawn_reaper(child, kill_rx);

        Ok(WorkerChannel {
            pid,
            tx: pool_tx,
            rx: worker_rx,
            kill: Some(kill_tx),
            exit: Some(reaper),
        })
    }
}

/// Forward pool messages to the worker's stdin, one JSON line per frame.
/// Ends (closing stdin) when the pool drops its sender.
fn spawn_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<PoolMessage>) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to encode pool message");
                    continue;
                }
            };
            if stdin.write_all(json.as_bytes()).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                warn!("Worker stdin closed; stopping writer");
                break;
            }
        }
        // stdin drops here: the worker sees EOF and exits its run loop.
    });
}

/// Parse worker stdout frames and forward them to the pool.
fn spawn_reader(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::Sender<WorkerMessage>,
    pid: Option<u32>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!(pid = ?pid, "Worker stdout closed (EOF)");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkerMessage>(trimmed) {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                debug!(pid = ?pid, "Pool receiver dropped; stopping reader");
                                break;
                            }
                        }
                        Err(e) => {
                            let preview: String = trimmed.chars().take(200).collect();
                            warn!(pid = ?pid, error = %e, preview = %preview, "Unparseable worker frame");
                        }
                    }
                }
                Err(e) => {
                    error!(pid = ?pid, error = %e, "Error reading worker stdout");
                    break;
                }
            }
        }
        // tx drops here: the pool observes the worker as gone.
    });
}

/// Re-emit worker stderr through tracing.
fn spawn_stderr_logger(stderr: tokio::process::ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        debug!(pid = ?pid, stderr = %trimmed, "Worker stderr");
                    }
                }
                Err(e) => {
                    error!(pid = ?pid, error = %e, "Error reading worker stderr");
                    break;
                }
            }
        }
    });
}

/// Own the child: reap it on natural exit, or kill it when the trigger
/// fires. A dropped trigger (graceful path) just waits. The returned
/// handle completes once the process is reaped.
fn spawn_reaper(
    mut child: tokio::process::Child,
    mut kill_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            fired = &mut kill_rx => {
                if fired.is_ok() {
                    warn!(pid = ?child.id(), "Killing worker process");
                    let _ = child.start_kill();
                }
                let _ = child.wait().await;
            }
            status = child.wait() => {
                match status {
                    Ok(status) => debug!(code = ?status.code(), "Worker process exited"),
                    Err(e) => error!(error = %e, "Failed waiting on worker process"),
                }
            }
        }
    })
}
