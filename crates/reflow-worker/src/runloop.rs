//! Worker run loop: the worker-side half of the pool protocol.
//!
//! Frames are one JSON object per line. The loop announces itself with an
//! initialization frame, then serves task assignments strictly one at a
//! time. Each task runs on its own spawned tokio task so a panic is
//! contained and reported as a task-level problem rather than killing the
//! worker. Stdin EOF ends the loop gracefully.

use std::path::PathBuf;
use std::sync::Arc;

use reflow_core::{RemoteError, TaskPayload, TaskUid};
use reflow_proto::{PayloadError, PayloadRef, PoolMessage, SharedPayloadChannel, WorkerMessage};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::module::{ProgressReporter, TaskModule};

const OUTBOUND_DEPTH: usize = 64;

/// Fatal worker errors. Task-level failures are reported over the wire
/// instead; these end the process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Control-stream I/O failure.
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shared payload channel could not be opened.
    #[error("payload channel error: {0}")]
    Payload(#[from] PayloadError),
}

/// Serve the module over a control stream until it reaches EOF.
///
/// Generic over the streams so tests can drive the full protocol through
/// in-memory pipes; production passes stdin/stdout.
pub async fn run<R, W>(
    module: TaskModule,
    spool_dir: impl Into<PathBuf>,
    reader: R,
    writer: W,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let payloads = SharedPayloadChannel::new(spool_dir)?;
    let (out_tx, out_rx) = mpsc::channel::<WorkerMessage>(OUTBOUND_DEPTH);
    let writer_task = spawn_frame_writer(writer, out_rx);

    let worker_pid = std::process::id();
    out_tx
        .send(WorkerMessage::Initialization { worker_pid })
        .await
        .ok();
    info!(module = module.name(), worker_pid, "Worker initialized");

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let PoolMessage::WorkerTask { task_uid, payload } =
            match serde_json::from_str::<PoolMessage>(trimmed) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "Unparseable pool frame");
                    out_tx
                        .send(WorkerMessage::Problem {
                            task_uid: None,
                            error: RemoteError::new(
                                format!("unparseable pool frame: {e}"),
                                String::new(),
                            ),
                        })
                        .await
                        .ok();
                    continue;
                }
            };

        out_tx
            .send(WorkerMessage::Acknowledgement {
                task_uid: task_uid.clone(),
                worker_pid,
            })
            .await
            .ok();
        serve_task(&module, &payloads, &out_tx, task_uid, payload).await;
    }

    debug!("Control stream closed; worker shutting down");
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Execute one task and report its terminal frame. Never returns an error:
/// every failure mode becomes a `Problem` frame for this task.
async fn serve_task(
    module: &TaskModule,
    payloads: &SharedPayloadChannel,
    out_tx: &mpsc::Sender<WorkerMessage>,
    task_uid: TaskUid,
    payload: PayloadRef,
) {
    let problem = |error: RemoteError| WorkerMessage::Problem {
        task_uid: Some(task_uid.clone()),
        error,
    };

    let task = match payloads
        .consume(&payload)
        .map_err(|e| RemoteError::from_error(&e))
        .and_then(|bytes| {
            TaskPayload::from_bytes(&bytes).map_err(|e| RemoteError::from_error(&e))
        }) {
        Ok(task) => task,
        Err(error) => {
            out_tx.send(problem(error)).await.ok();
            return;
        }
    };

    let Some(func) = module.get(&task.function_name) else {
        out_tx
            .send(problem(RemoteError::new(
                format!(
                    "unknown function '{}' in task module '{}'",
                    task.function_name,
                    module.name()
                ),
                String::new(),
            )))
            .await
            .ok();
        return;
    };

    debug!(task_uid = %task_uid, function = %task.function_name, "Executing task");
    let reporter = ProgressReporter::new(task_uid.clone(), out_tx.clone());
    let func = Arc::clone(func);
    let joined =
        tokio::spawn(async move { func.call(task.args, task.kwargs, reporter).await }).await;

    let frame = match joined {
        Ok(Ok(value)) => match serde_json::to_vec(&value) {
            Ok(bytes) => match payloads.publish(&bytes) {
                Ok(result_ref) => WorkerMessage::Result {
                    task_uid: task_uid.clone(),
                    payload: result_ref,
                },
                Err(e) => problem(RemoteError::from_error(&e)),
            },
            Err(e) => problem(RemoteError::from_error(&e)),
        },
        Ok(Err(error)) => problem(error),
        // The task panicked; the panic stays contained to its spawned task.
        Err(e) => problem(RemoteError::new(
            format!("task panicked: {e}"),
            String::new(),
        )),
    };
    out_tx.send(frame).await.ok();
}

/// Serialize outbound frames to the control stream, one JSON line each.
fn spawn_frame_writer<W>(mut writer: W, mut rx: mpsc::Receiver<WorkerMessage>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode worker frame");
                    continue;
                }
            };
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                warn!("Control stream writer closed");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::task_fn;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        payloads: SharedPayloadChannel,
        to_worker: WriteHalf<DuplexStream>,
        from_worker: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        _spool: tempfile::TempDir,
    }

    impl Harness {
        /// Start `run` over in-memory pipes and a fresh spool directory.
        fn start(module: TaskModule) -> Self {
            let spool = tempfile::tempdir().unwrap();
            let payloads = SharedPayloadChannel::new(spool.path()).unwrap();

            let (pool_side, worker_side) = duplex(64 * 1024);
            let (worker_read, worker_write) = tokio::io::split(worker_side);
            let (pool_read, pool_write) = tokio::io::split(pool_side);

            tokio::spawn(run(
                module,
                spool.path().to_path_buf(),
                worker_read,
                worker_write,
            ));

            Self {
                payloads,
                to_worker: pool_write,
                from_worker: BufReader::new(pool_read).lines(),
                _spool: spool,
            }
        }

        async fn assign(&mut self, task_uid: &str, payload: &TaskPayload) {
            let region = self.payloads.publish(&payload.to_bytes().unwrap()).unwrap();
            let frame = serde_json::to_string(&PoolMessage::WorkerTask {
                task_uid: TaskUid::new(task_uid),
                payload: region,
            })
            .unwrap();
            self.to_worker.write_all(frame.as_bytes()).await.unwrap();
            self.to_worker.write_all(b"\n").await.unwrap();
        }

        async fn next_frame(&mut self) -> WorkerMessage {
            let line = self.from_worker.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn math_module() -> TaskModule {
        let mut module = TaskModule::new("math");
        module
            .register(
                "square",
                task_fn(|args, _, _| async move {
                    let n = args[0]
                        .as_i64()
                        .ok_or_else(|| RemoteError::new("expected integer", String::new()))?;
                    Ok(json!(n * n))
                }),
            )
            .unwrap();
        module
            .register(
                "countdown",
                task_fn(|_, _, progress| async move {
                    for (p, m) in [(0.5, "half"), (1.0, "done")] {
                        progress.report(p, m).await;
                    }
                    Ok(json!("landed"))
                }),
            )
            .unwrap();
        module
            .register(
                "panicky",
                task_fn(|_, _, _| async move {
                    panic!("deliberate test panic");
                    #[allow(unreachable_code)]
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        module
    }

    use serde_json::Value;

    #[tokio::test]
    async fn test_initialization_is_first_frame() {
        let mut h = Harness::start(math_module());
        assert!(matches!(
            h.next_frame().await,
            WorkerMessage::Initialization { .. }
        ));
    }

    #[tokio::test]
    async fn test_task_acked_then_result_published() {
        let mut h = Harness::start(math_module());
        h.next_frame().await; // initialization

        h.assign("t-1", &TaskPayload::new("square").with_arg(json!(7)))
            .await;

        match h.next_frame().await {
            WorkerMessage::Acknowledgement { task_uid, .. } => {
                assert_eq!(task_uid, TaskUid::new("t-1"));
            }
            other => panic!("expected Acknowledgement, got {other:?}"),
        }
        match h.next_frame().await {
            WorkerMessage::Result { task_uid, payload } => {
                assert_eq!(task_uid, TaskUid::new("t-1"));
                let bytes = h.payloads.consume(&payload).unwrap();
                assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!(49));
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_precedes_result_in_order() {
        let mut h = Harness::start(math_module());
        h.next_frame().await;

        h.assign("t-2", &TaskPayload::new("countdown")).await;
        h.next_frame().await; // acknowledgement

        let mut seen = Vec::new();
        loop {
            match h.next_frame().await {
                WorkerMessage::Progress { progress, .. } => seen.push(progress),
                WorkerMessage::Result { .. } => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(seen, vec![0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_unknown_function_is_task_problem() {
        let mut h = Harness::start(math_module());
        h.next_frame().await;

        h.assign("t-3", &TaskPayload::new("no_such_function")).await;
        h.next_frame().await; // acknowledgement

        match h.next_frame().await {
            WorkerMessage::Problem { task_uid, error } => {
                assert_eq!(task_uid, Some(TaskUid::new("t-3")));
                assert!(error.message.contains("no_such_function"));
            }
            other => panic!("expected Problem, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_worker_survives() {
        let mut h = Harness::start(math_module());
        h.next_frame().await;

        h.assign("t-4", &TaskPayload::new("panicky")).await;
        h.next_frame().await; // acknowledgement
        match h.next_frame().await {
            WorkerMessage::Problem { task_uid, error } => {
                assert_eq!(task_uid, Some(TaskUid::new("t-4")));
                assert!(error.message.contains("panicked"));
            }
            other => panic!("expected Problem, got {other:?}"),
        }

        // The worker still serves the next task.
        h.assign("t-5", &TaskPayload::new("square").with_arg(json!(3)))
            .await;
        h.next_frame().await; // acknowledgement
        assert!(matches!(
            h.next_frame().await,
            WorkerMessage::Result { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_payload_region_is_task_problem() {
        let mut h = Harness::start(math_module());
        h.next_frame().await;

        // Publish and immediately consume so the region is gone by the time
        // the worker fetches it.
        let region = h.payloads.publish(b"{}").unwrap();
        h.payloads.consume(&region).unwrap();
        let frame = serde_json::to_string(&PoolMessage::WorkerTask {
            task_uid: TaskUid::new("t-6"),
            payload: region,
        })
        .unwrap();
        h.to_worker.write_all(frame.as_bytes()).await.unwrap();
        h.to_worker.write_all(b"\n").await.unwrap();

        h.next_frame().await; // acknowledgement
        match h.next_frame().await {
            WorkerMessage::Problem { task_uid, .. } => {
                assert_eq!(task_uid, Some(TaskUid::new("t-6")));
            }
            other => panic!("expected Problem, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_shuts_worker_down() {
        let spool = tempfile::tempdir().unwrap();
        let (pool_side, worker_side) = duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (pool_read, pool_write) = tokio::io::split(pool_side);

        let worker = tokio::spawn(run(
            math_module(),
            spool.path().to_path_buf(),
            worker_read,
            worker_write,
        ));

        let mut frames = BufReader::new(pool_read).lines();
        frames.next_line().await.unwrap().unwrap(); // initialization

        // Dropping both pool-side halves closes the stream; the worker sees
        // EOF on its task stream and exits its loop.
        drop(frames);
        drop(pool_write);
        worker.await.unwrap().unwrap();
    }
}
