//! Fixed-size pool of worker processes.
//!
//! The pool owns the control-plane side of the worker protocol:
//! submission, acknowledgement, progress fan-out, result/error delivery
//! and the two-tier shutdown (graceful close/stop vs. hard interrupt).
//! Task payloads and results travel through the shared payload channel;
//! only references cross the dispatch queue.

mod process;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use process::ProcessLauncher;
pub use transport::{WorkerChannel, WorkerLauncher, WorkerParameters};

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use reflow_core::{PoolState, RemoteError, TaskError, TaskOutcome, TaskPayload, TaskUid, WorkerState};
use reflow_proto::{PayloadError, PayloadRef, PoolMessage, SharedPayloadChannel, WorkerMessage};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Submission rejected: the pool is not `Running`.
    #[error("pool is not accepting submissions")]
    Closed,

    /// A worker failed to start or initialize in time.
    #[error("worker startup failed: {0}")]
    WorkerStartup(String),

    /// A worker sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Transport-level failure talking to a worker.
    #[error("worker transport error: {0}")]
    Transport(String),

    /// Shared payload channel failure.
    #[error("payload channel error: {0}")]
    Payload(#[from] PayloadError),

    /// Payload (de)serialization failure.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Progress report forwarded to a task's subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Completion fraction in `[0, 1]`, as reported by the task function.
    pub progress: f64,

    /// Free-form status message.
    pub message: String,
}

/// Handle to a submitted task. Cloneable; every clone observes the same
/// single-assignment outcome.
#[derive(Clone)]
pub struct TaskTicket {
    uid: TaskUid,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

impl TaskTicket {
    /// The task's uid.
    pub fn uid(&self) -> &TaskUid {
        &self.uid
    }

    /// Wait for the task's outcome. Safe to call on any number of clones;
    /// all observe the same result. Dropping one ticket never cancels the
    /// underlying task.
    pub async fn wait(&mut self) -> TaskOutcome {
        match self.outcome.wait_for(|o| o.is_some()).await {
            Ok(guard) => guard.clone().expect("checked by wait_for"),
            // Pool tore down without resolving us: hard shutdown.
            Err(_) => Err(TaskError::Cancelled),
        }
    }
}

struct Pending {
    outcome: watch::Sender<Option<TaskOutcome>>,
    progress: Option<mpsc::Sender<ProgressUpdate>>,
    input: PayloadRef,
    worker_pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
}

struct QueuedTask {
    uid: TaskUid,
    payload: PayloadRef,
}

enum ServeEnd {
    QueueClosed,
    WorkerFault,
}

struct PoolInner {
    state: StdMutex<PoolState>,
    params: WorkerParameters,
    launcher: Arc<dyn WorkerLauncher>,
    payloads: SharedPayloadChannel,
    init_timeout: std::time::Duration,
    queue_tx: StdMutex<Option<mpsc::Sender<QueuedTask>>>,
    queue_rx: Mutex<mpsc::Receiver<QueuedTask>>,
    pending: StdMutex<HashMap<TaskUid, Pending>>,
    worker_states: StdMutex<HashMap<usize, WorkerState>>,
    kills: StdMutex<HashMap<usize, oneshot::Sender<()>>>,
    supervisors: StdMutex<Vec<JoinHandle<()>>>,
}

/// Multi-process task pool.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    /// Start the pool: launch every worker, wait for each to initialize,
    /// then begin dispatching. A worker that cannot start (e.g. an unknown
    /// task module) fails the whole startup.
    pub async fn start(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, PoolError> {
        let payloads = SharedPayloadChannel::new(&config.spool_dir)?;
        let params = WorkerParameters {
            task_module: config.task_module.clone(),
            spool_dir: config.spool_dir.clone(),
        };
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);

        let inner = Arc::new(PoolInner {
            state: StdMutex::new(PoolState::Created),
            params,
            launcher,
            payloads,
            init_timeout: config.init_timeout,
            queue_tx: StdMutex::new(Some(queue_tx)),
            queue_rx: Mutex::new(queue_rx),
            pending: StdMutex::new(HashMap::new()),
            worker_states: StdMutex::new(HashMap::new()),
            kills: StdMutex::new(HashMap::new()),
            supervisors: StdMutex::new(Vec::new()),
        });

        for slot in 0..config.size {
            inner.set_worker_state(slot, WorkerState::Created);
            let channel = match inner.launch_worker(slot).await {
                Ok(channel) => channel,
                Err(e) => {
                    inner.set_state(PoolState::Error);
                    inner.queue_tx.lock().unwrap().take();
                    for handle in inner.supervisors.lock().unwrap().drain(..) {
                        handle.abort();
                    }
                    for (_, kill) in inner.kills.lock().unwrap().drain() {
                        kill.send(()).ok();
                    }
                    return Err(e);
                }
            };
            let supervisor = tokio::spawn(supervise(Arc::clone(&inner), slot, channel));
            inner.supervisors.lock().unwrap().push(supervisor);
        }

        inner.set_state(PoolState::Running);
        info!(workers = config.size, "Task pool running");
        Ok(Self { inner })
    }

    /// Start the pool with subprocess workers from the configured binary.
    pub async fn start_with_processes(config: PoolConfig) -> Result<Self, PoolError> {
        let launcher = Arc::new(ProcessLauncher::new(config.worker_binary.clone()));
        Self::start(config, launcher).await
    }

    /// Current pool state.
    pub fn state(&self) -> PoolState {
        *self.inner.state.lock().unwrap()
    }

    /// Current state of each worker slot.
    pub fn worker_states(&self) -> HashMap<usize, WorkerState> {
        self.inner.worker_states.lock().unwrap().clone()
    }

    /// Number of unresolved tasks (queued or in flight).
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Submit a task. The payload goes through the shared channel; the
    /// returned ticket resolves exactly once with the task's outcome.
    pub fn submit(&self, payload: &TaskPayload) -> Result<TaskTicket, PoolError> {
        self.submit_inner(payload, None)
    }

    /// Submit a task and subscribe to its progress stream. Progress
    /// delivery is fire-and-forget: a full or dropped subscriber loses
    /// updates, never blocks the pool.
    pub fn submit_with_progress(
        &self,
        payload: &TaskPayload,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> Result<TaskTicket, PoolError> {
        self.submit_inner(payload, Some(progress))
    }

    fn submit_inner(
        &self,
        payload: &TaskPayload,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<TaskTicket, PoolError> {
        if !self.state().accepts_submissions() {
            return Err(PoolError::Closed);
        }

        let bytes = payload.to_bytes()?;
        let input = self.inner.payloads.publish(&bytes)?;
        let uid = TaskUid::generate();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        self.inner.pending.lock().unwrap().insert(
            uid.clone(),
            Pending {
                outcome: outcome_tx,
                progress,
                input: input.clone(),
                worker_pid: None,
                started_at: None,
            },
        );

        let queue_tx = {
            let guard = self.inner.queue_tx.lock().unwrap();
            guard.clone()
        };
        let Some(queue_tx) = queue_tx else {
            self.inner.pending.lock().unwrap().remove(&uid);
            self.inner.payloads.release(&input);
            return Err(PoolError::Closed);
        };

        let queued = QueuedTask {
            uid: uid.clone(),
            payload: input.clone(),
        };
        if queue_tx.try_send(queued).is_err() {
            self.inner.pending.lock().unwrap().remove(&uid);
            self.inner.payloads.release(&input);
            return Err(PoolError::Closed);
        }

        debug!(task_uid = %uid, function = %payload.function_name, "Task submitted");
        Ok(TaskTicket {
            uid,
            outcome: outcome_rx,
        })
    }

    /// Stop accepting submissions; in-flight and queued tasks keep
    /// draining.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(*state, PoolState::Running) {
            *state = PoolState::Closed;
        }
        drop(state);
        // Closing the queue lets idle workers run off the end of it.
        self.inner.queue_tx.lock().unwrap().take();
        info!("Task pool closed to new submissions");
    }

    /// Graceful shutdown: close, drain, wait for every worker process to
    /// exit, then transition to `Stopped`.
    pub async fn stop(&self) {
        self.close();
        let supervisors: Vec<JoinHandle<()>> =
            self.inner.supervisors.lock().unwrap().drain(..).collect();
        for handle in supervisors {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Worker supervisor panicked");
                }
            }
        }
        self.inner.set_state(PoolState::Stopped);
        info!("Task pool stopped");
    }

    /// Hard cancellation: resolve every pending ticket with a cancellation
    /// error, tear down worker processes without waiting, and transition
    /// straight to `Stopped`. Intended to run from a shutdown hook.
    pub fn interrupt(&self) {
        warn!("Task pool interrupted; cancelling all awaiters");
        self.inner.queue_tx.lock().unwrap().take();

        let pending: Vec<(TaskUid, Pending)> =
            self.inner.pending.lock().unwrap().drain().collect();
        for (uid, entry) in pending {
            self.inner.payloads.release(&entry.input);
            entry.outcome.send(Some(Err(TaskError::Cancelled))).ok();
            debug!(task_uid = %uid, "Cancelled awaiter");
        }

        let kills: Vec<oneshot::Sender<()>> = {
            let mut guard = self.inner.kills.lock().unwrap();
            guard.drain().map(|(_, k)| k).collect()
        };
        for kill in kills {
            kill.send(()).ok();
        }

        for handle in self.inner.supervisors.lock().unwrap().drain(..) {
            handle.abort();
        }

        self.inner.set_state(PoolState::Stopped);
    }
}

impl PoolInner {
    fn set_state(&self, state: PoolState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_worker_state(&self, slot: usize, state: WorkerState) {
        self.worker_states.lock().unwrap().insert(slot, state);
    }

    /// Launch one worker and wait for its `Initialization` frame.
    async fn launch_worker(self: &Arc<Self>, slot: usize) -> Result<WorkerChannel, PoolError> {
        let mut channel = self.launcher.launch(&self.params).await?;
        if let Some(kill) = channel.kill.take() {
            self.kills.lock().unwrap().insert(slot, kill);
        }

        let deadline = tokio::time::Instant::now() + self.init_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, channel.rx.recv())
                .await
                .map_err(|_| {
                    PoolError::WorkerStartup("timed out waiting for initialization".to_string())
                })?;
            match frame {
                Some(WorkerMessage::Initialization { worker_pid }) => {
                    info!(slot, worker_pid, "Worker initialized");
                    self.set_worker_state(slot, WorkerState::Idle);
                    return Ok(channel);
                }
                Some(WorkerMessage::Log { line, .. }) => {
                    debug!(slot, worker = %line, "Worker log");
                }
                Some(other) => {
                    return Err(PoolError::WorkerStartup(format!(
                        "expected initialization, got {other:?}"
                    )));
                }
                None => {
                    return Err(PoolError::WorkerStartup(
                        "worker exited before initializing".to_string(),
                    ));
                }
            }
        }
    }

    fn resolve(&self, uid: &TaskUid, outcome: TaskOutcome) {
        let entry = self.pending.lock().unwrap().remove(uid);
        match entry {
            Some(entry) => {
                if let Some(started) = entry.started_at {
                    let elapsed = Utc::now().signed_duration_since(started);
                    debug!(
                        task_uid = %uid,
                        worker_pid = ?entry.worker_pid,
                        elapsed_ms = elapsed.num_milliseconds(),
                        "Task resolved"
                    );
                }
                entry.outcome.send(Some(outcome)).ok();
            }
            None => warn!(task_uid = %uid, "Outcome for unknown task; dropping"),
        }
    }

    fn record_ack(&self, uid: &TaskUid, worker_pid: u32) {
        if let Some(entry) = self.pending.lock().unwrap().get_mut(uid) {
            entry.worker_pid = Some(worker_pid);
            entry.started_at = Some(Utc::now());
        }
        debug!(task_uid = %uid, worker_pid, "Task acknowledged");
    }

    fn forward_progress(&self, uid: &TaskUid, progress: f64, message: String) {
        let guard = self.pending.lock().unwrap();
        if let Some(tx) = guard.get(uid).and_then(|e| e.progress.as_ref()) {
            // Fire-and-forget: never block the control loop on a slow
            // subscriber.
            tx.try_send(ProgressUpdate { progress, message }).ok();
        }
    }

    /// Dereference a result payload and resolve the ticket.
    fn complete(&self, uid: &TaskUid, payload: &PayloadRef) {
        let outcome = self
            .payloads
            .consume(payload)
            .map_err(|e| {
                TaskError::Failed(RemoteError::new(
                    format!("result payload unavailable: {e}"),
                    String::new(),
                ))
            })
            .and_then(|bytes| {
                serde_json::from_slice::<Value>(&bytes).map_err(|e| {
                    TaskError::Failed(RemoteError::new(
                        format!("result payload undecodable: {e}"),
                        String::new(),
                    ))
                })
            });
        self.resolve(uid, outcome);
    }
}

/// Per-slot supervisor: feeds one worker from the shared queue and
/// translates its messages, respawning it after a worker-level fault.
async fn supervise(inner: Arc<PoolInner>, slot: usize, mut channel: WorkerChannel) {
    loop {
        let end = serve(&inner, slot, &mut channel).await;
        match end {
            ServeEnd::QueueClosed => {
                // Dropping the channel closes the worker's task stream (its
                // graceful-shutdown signal); then wait for the process to
                // actually exit so `stop` only returns once every worker is
                // gone.
                let exit = channel.exit.take();
                drop(channel);
                if let Some(exit) = exit {
                    let _ = exit.await;
                }
                inner.set_worker_state(slot, WorkerState::Stopped);
                debug!(slot, "Worker drained and exited");
                return;
            }
            ServeEnd::WorkerFault => {
                inner.set_worker_state(slot, WorkerState::Error);
                // Make sure the faulted process is gone before reusing the
                // slot; a protocol-level fault can leave it alive.
                if let Some(kill) = inner.kills.lock().unwrap().remove(&slot) {
                    kill.send(()).ok();
                }
                if let Some(exit) = channel.exit.take() {
                    let _ = exit.await;
                }
                // A Closed pool is still draining queued tasks; only a
                // terminal pool releases the slot.
                if inner.state.lock().unwrap().is_terminal() {
                    return;
                }
                warn!(slot, "Respawning worker after fault");
                match inner.launch_worker(slot).await {
                    Ok(fresh) => channel = fresh,
                    Err(e) => {
                        error!(slot, error = %e, "Respawn failed; slot abandoned");
                        inner.set_worker_state(slot, WorkerState::Error);
                        return;
                    }
                }
            }
        }
    }
}

/// Dispatch loop for one live worker. Returns when the queue closes or
/// the worker faults.
async fn serve(inner: &Arc<PoolInner>, slot: usize, channel: &mut WorkerChannel) -> ServeEnd {
    loop {
        inner.set_worker_state(slot, WorkerState::Idle);

        // While idle, watch both the shared queue and the worker itself
        // (it can still crash or log between tasks).
        let task = tokio::select! {
            queued = async { inner.queue_rx.lock().await.recv().await } => {
                match queued {
                    Some(task) => task,
                    None => return ServeEnd::QueueClosed,
                }
            }
            msg = channel.rx.recv() => {
                match msg {
                    Some(WorkerMessage::Log { task_uid, line }) => {
                        debug!(slot, task_uid = ?task_uid, worker = %line, "Worker log");
                        continue;
                    }
                    Some(WorkerMessage::Problem { task_uid: None, error }) => {
                        error!(slot, error = %error.message, "Worker-level fault while idle");
                        return ServeEnd::WorkerFault;
                    }
                    Some(other) => {
                        warn!(slot, frame = ?other, "Unexpected frame from idle worker");
                        continue;
                    }
                    None => return ServeEnd::WorkerFault,
                }
            }
        };

        inner.set_worker_state(slot, WorkerState::Working);
        let assignment = PoolMessage::WorkerTask {
            task_uid: task.uid.clone(),
            payload: task.payload.clone(),
        };
        if channel.tx.send(assignment).await.is_err() {
            inner.resolve(
                &task.uid,
                Err(TaskError::WorkerFault(
                    "worker went away before dispatch".to_string(),
                )),
            );
            return ServeEnd::WorkerFault;
        }

        // Message loop for the in-flight task.
        loop {
            match channel.rx.recv().await {
                Some(WorkerMessage::Acknowledgement { task_uid, worker_pid }) => {
                    inner.record_ack(&task_uid, worker_pid);
                }
                Some(WorkerMessage::Progress {
                    task_uid,
                    progress,
                    message,
                }) => {
                    inner.forward_progress(&task_uid, progress, message);
                }
                Some(WorkerMessage::Log { task_uid, line }) => {
                    debug!(slot, task_uid = ?task_uid, worker = %line, "Worker log");
                }
                Some(WorkerMessage::Result { task_uid, payload }) => {
                    inner.complete(&task_uid, &payload);
                    break;
                }
                Some(WorkerMessage::Problem {
                    task_uid: Some(task_uid),
                    error,
                }) => {
                    inner.resolve(&task_uid, Err(TaskError::Failed(error)));
                    break;
                }
                Some(WorkerMessage::Problem {
                    task_uid: None,
                    error,
                }) => {
                    error!(slot, error = %error.message, "Worker-level fault mid-task");
                    inner.resolve(
                        &task.uid,
                        Err(TaskError::WorkerFault(error.message)),
                    );
                    return ServeEnd::WorkerFault;
                }
                Some(WorkerMessage::Initialization { worker_pid }) => {
                    warn!(slot, worker_pid, "Unexpected re-initialization frame");
                }
                None => {
                    inner.resolve(
                        &task.uid,
                        Err(TaskError::WorkerFault(
                            "worker exited mid-task".to_string(),
                        )),
                    );
                    return ServeEnd::WorkerFault;
                }
            }
        }
    }
}
