//! Task modules: named tables of executable task functions.
//!
//! A worker serves exactly one module for its whole life; the module name
//! arrives on the command line and the pool routes tasks by function name
//! within it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use reflow_core::{RemoteError, TaskUid};
use reflow_proto::WorkerMessage;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// Module assembly errors.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Two functions registered under the same name.
    #[error("duplicate function '{function}' in task module '{module}'")]
    DuplicateFunction { module: String, function: String },
}

/// Handle a running task function uses to stream progress and log lines
/// back to the pool. Cloneable and cheap.
#[derive(Clone)]
pub struct ProgressReporter {
    task_uid: TaskUid,
    out: mpsc::Sender<WorkerMessage>,
}

impl ProgressReporter {
    pub(crate) fn new(task_uid: TaskUid, out: mpsc::Sender<WorkerMessage>) -> Self {
        Self { task_uid, out }
    }

    /// Report task progress. `progress` is a completion fraction in
    /// `[0, 1]`; reports are delivered to the subscriber in emission order.
    pub async fn report(&self, progress: f64, message: impl Into<String>) {
        self.out
            .send(WorkerMessage::Progress {
                task_uid: self.task_uid.clone(),
                progress,
                message: message.into(),
            })
            .await
            .ok();
    }

    /// Emit a log line attributed to this task.
    pub async fn log(&self, line: impl Into<String>) {
        self.out
            .send(WorkerMessage::Log {
                task_uid: Some(self.task_uid.clone()),
                line: line.into(),
            })
            .await
            .ok();
    }
}

/// One executable task function.
#[async_trait]
pub trait TaskFn: Send + Sync {
    /// Execute the function over its decoded payload.
    async fn call(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        progress: ProgressReporter,
    ) -> Result<Value, RemoteError>;
}

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskFn>
where
    F: Fn(Vec<Value>, Map<String, Value>, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    struct FnTask<F>(F);

    #[async_trait]
    impl<F, Fut> TaskFn for FnTask<F>
    where
        F: Fn(Vec<Value>, Map<String, Value>, ProgressReporter) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, RemoteError>> + Send,
    {
        async fn call(
            &self,
            args: Vec<Value>,
            kwargs: Map<String, Value>,
            progress: ProgressReporter,
        ) -> Result<Value, RemoteError> {
            (self.0)(args, kwargs, progress).await
        }
    }

    Arc::new(FnTask(f))
}

/// Named table of task functions.
pub struct TaskModule {
    name: String,
    functions: HashMap<String, Arc<dyn TaskFn>>,
}

impl TaskModule {
    /// Create an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a function. Duplicate names are rejected.
    pub fn register(
        &mut self,
        function: impl Into<String>,
        task: Arc<dyn TaskFn>,
    ) -> Result<(), ModuleError> {
        let function = function.into();
        if self.functions.contains_key(&function) {
            return Err(ModuleError::DuplicateFunction {
                module: self.name.clone(),
                function,
            });
        }
        self.functions.insert(function, task);
        Ok(())
    }

    /// Look up a function by name.
    pub fn get(&self, function: &str) -> Option<&Arc<dyn TaskFn>> {
        self.functions.get(function)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when no functions are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
