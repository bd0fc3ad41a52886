//! In-process worker stand-ins for exercising the pool without spawning
//! subprocesses. Test-only.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reflow_core::{RemoteError, TaskPayload};
use reflow_proto::{PoolMessage, SharedPayloadChannel, WorkerMessage};
use serde_json::json;
use tokio::sync::mpsc;

use super::transport::{WorkerChannel, WorkerLauncher, WorkerParameters};
use super::PoolError;

/// Launcher that speaks the full worker protocol over channels and the
/// real payload spool, with a small scripted function table.
pub(crate) struct FakeWorkerLauncher {
    launches: AtomicUsize,
    exits: std::sync::Arc<AtomicUsize>,
    fail_init: bool,
}

impl FakeWorkerLauncher {
    pub(crate) fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            exits: std::sync::Arc::new(AtomicUsize::new(0)),
            fail_init: false,
        }
    }

    /// Simulates workers that die before initializing.
    pub(crate) fn failing_init() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            exits: std::sync::Arc::new(AtomicUsize::new(0)),
            fail_init: true,
        }
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of fake workers that have fully exited.
    pub(crate) fn exit_count(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for FakeWorkerLauncher {
    async fn launch(&self, params: &WorkerParameters) -> Result<WorkerChannel, PoolError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (pool_tx, pool_rx) = mpsc::channel(16);
        let (worker_tx, worker_rx) = mpsc::channel(16);

        let exit = if self.fail_init {
            drop(worker_tx);
            None
        } else {
            let spool = params.spool_dir.clone();
            let worker = tokio::spawn(run_fake_worker(spool, pool_rx, worker_tx));
            let exits = std::sync::Arc::clone(&self.exits);
            Some(tokio::spawn(async move {
                let _ = worker.await;
                exits.fetch_add(1, Ordering::SeqCst);
            }))
        };

        Ok(WorkerChannel {
            pid: Some(7),
            tx: pool_tx,
            rx: worker_rx,
            kill: None,
            exit,
        })
    }
}

async fn run_fake_worker(
    spool: std::path::PathBuf,
    mut rx: mpsc::Receiver<PoolMessage>,
    tx: mpsc::Sender<WorkerMessage>,
) {
    let payloads = SharedPayloadChannel::new(&spool).unwrap();
    tx.send(WorkerMessage::Initialization { worker_pid: 7 })
        .await
        .ok();

    while let Some(PoolMessage::WorkerTask { task_uid, payload }) = rx.recv().await {
        tx.send(WorkerMessage::Acknowledgement {
            task_uid: task_uid.clone(),
            worker_pid: 7,
        })
        .await
        .ok();

        let bytes = payloads.consume(&payload).unwrap();
        let task = TaskPayload::from_bytes(&bytes).unwrap();

        match task.function_name.as_str() {
            "double" => {
                let n = task.args[0].as_i64().unwrap();
                let out = payloads
                    .publish(&serde_json::to_vec(&json!(n * 2)).unwrap())
                    .unwrap();
                tx.send(WorkerMessage::Result {
                    task_uid,
                    payload: out,
                })
                .await
                .ok();
            }
            "fail" => {
                tx.send(WorkerMessage::Problem {
                    task_uid: Some(task_uid),
                    error: RemoteError::new("intentional failure", "fake_worker::fail"),
                })
                .await
                .ok();
            }
            "crash" => {
                // Dropping both channels looks like a dead process.
                return;
            }
            "progressive" => {
                for (p, m) in [(0.25, "quarter"), (0.5, "half"), (1.0, "done")] {
                    tx.send(WorkerMessage::Progress {
                        task_uid: task_uid.clone(),
                        progress: p,
                        message: m.to_string(),
                    })
                    .await
                    .ok();
                }
                let out = payloads
                    .publish(&serde_json::to_vec(&json!("done")).unwrap())
                    .unwrap();
                tx.send(WorkerMessage::Result {
                    task_uid,
                    payload: out,
                })
                .await
                .ok();
            }
            "hang" => {
                std::future::pending::<()>().await;
            }
            other => {
                tx.send(WorkerMessage::Problem {
                    task_uid: Some(task_uid),
                    error: RemoteError::new(format!("unknown function '{other}'"), String::new()),
                })
                .await
                .ok();
            }
        }
    }
}
