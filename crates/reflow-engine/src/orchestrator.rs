//! Computation orchestration: cache key, per-key lock, double-checked
//! cache, inline or pooled execution.
//!
//! The orchestrator turns N concurrent cache-miss requests for the same
//! key into one computation plus N-1 waiters. Cancelling one waiter never
//! cancels the computation for the rest: waiters only ever wait on the
//! per-key lock, and the computing caller's worker task outlives a
//! dropped ticket.

use std::sync::Arc;

use async_trait::async_trait;
use reflow_core::{cache_key, scope::MissingScope, CacheScope, RemoteError, ScopeContext, TaskError, TaskPayload};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::cache::CacheStore;
use crate::lock::{LockContext, LockError, MultiResourceLock};
use crate::pool::{PoolError, TaskPool};
use crate::registry::{EstimateSize, Registry, RegistryError};

/// Orchestrator errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Inline execution requested for a job that was never registered.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// A scoped cache was requested without the matching identity.
    #[error(transparent)]
    MissingScope(#[from] MissingScope),

    /// Offloading requested but the runtime has no pool.
    #[error("task offloading is disabled")]
    PoolDisabled,

    /// The computation itself failed (inline or in a worker).
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Pool-level submission failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Per-key lock failure (non-reentrant re-acquire).
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Per-call execution policy.
#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    /// Cache partitioning; `CacheScope::None` disables caching and locking
    /// entirely for this call.
    pub scope: CacheScope,

    /// Offload to the worker pool instead of running inline.
    pub run_as_task: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            scope: CacheScope::Global,
            run_as_task: false,
        }
    }
}

/// Inline job implementation, registered per job id.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job over its ordered inputs.
    async fn run(&self, inputs: &[Value]) -> Result<Value, RemoteError>;
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> JobHandler for FnHandler<F>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send,
    {
        async fn run(&self, inputs: &[Value]) -> Result<Value, RemoteError> {
            (self.0)(inputs.to_vec()).await
        }
    }

    Arc::new(FnHandler(f))
}

struct JobEntry {
    handler: Arc<dyn JobHandler>,
}

impl EstimateSize for JobEntry {
    fn estimate_size(&self) -> usize {
        std::mem::size_of::<JobEntry>()
    }
}

/// Ties cache, per-key locks and the pool together.
pub struct ComputationOrchestrator {
    cache: Arc<CacheStore<Value>>,
    locks: MultiResourceLock,
    pool: Option<TaskPool>,
    jobs: RwLock<Registry<String, JobEntry>>,
}

impl ComputationOrchestrator {
    /// Create an orchestrator over an existing cache, lock table and
    /// optional pool.
    pub fn new(
        cache: Arc<CacheStore<Value>>,
        locks: MultiResourceLock,
        pool: Option<TaskPool>,
    ) -> Self {
        Self {
            cache,
            locks,
            pool,
            jobs: RwLock::new(Registry::new("jobs", false)),
        }
    }

    /// Register an inline job handler under a stable id.
    pub async fn register_job(
        &self,
        job_id: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        self.jobs
            .write()
            .await
            .register(job_id.into(), JobEntry { handler })
    }

    /// The cache backing this orchestrator.
    pub fn cache(&self) -> &Arc<CacheStore<Value>> {
        &self.cache
    }

    /// Compute (or fetch) the value for a unit of work.
    ///
    /// With a cached scope: derive the key, take the per-key lock, re-check
    /// the cache (another caller may have filled it while we waited), and
    /// only on a genuine miss execute and store the result - pinned until
    /// its first read. With `CacheScope::None` this collapses to "always
    /// execute": no key, no lock, no cache, duplicate concurrent work
    /// accepted.
    pub async fn submit(
        &self,
        job_id: &str,
        inputs: Vec<Value>,
        options: JobOptions,
        scope: &ScopeContext,
        lock_ctx: &LockContext,
    ) -> Result<Value, OrchestratorError> {
        let Some(partition) = scope.partition(options.scope)? else {
            trace!(job_id, "Uncached job; executing directly");
            return self.execute(job_id, &inputs, options.run_as_task).await;
        };

        let key = cache_key(job_id, &inputs, &partition);
        let _guard = self.locks.acquire(&key, lock_ctx).await?;

        if let Some(hit) = self.cache.get(&key).await {
            trace!(job_id, key = %key, "Cache hit");
            return Ok(hit);
        }

        debug!(job_id, key = %key, run_as_task = options.run_as_task, "Cache miss; computing");
        let value = self.execute(job_id, &inputs, options.run_as_task).await?;
        self.cache.set(key, value.clone(), true).await;
        Ok(value)
    }

    async fn execute(
        &self,
        job_id: &str,
        inputs: &[Value],
        run_as_task: bool,
    ) -> Result<Value, OrchestratorError> {
        if run_as_task {
            let pool = self.pool.as_ref().ok_or(OrchestratorError::PoolDisabled)?;
            let mut payload = TaskPayload::new(job_id);
            payload.args = inputs.to_vec();
            let mut ticket = pool.submit(&payload)?;
            Ok(ticket.wait().await?)
        } else {
            let handler = {
                let jobs = self.jobs.read().await;
                let entry = jobs
                    .get(&job_id.to_string())
                    .map_err(|_| OrchestratorError::UnknownJob(job_id.to_string()))?;
                Arc::clone(&entry.handler)
            };
            handler
                .run(inputs)
                .await
                .map_err(|e| OrchestratorError::Task(TaskError::Failed(e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::config::PoolConfig;
    use crate::pool::testing::FakeWorkerLauncher;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn orchestrator() -> Arc<ComputationOrchestrator> {
        Arc::new(ComputationOrchestrator::new(
            Arc::new(CacheStore::new(CachePolicy::KeepAll)),
            MultiResourceLock::new(true),
            None,
        ))
    }

    /// Handler that counts executions and can be slowed down to widen the
    /// race window.
    fn counting_handler(counter: Arc<AtomicUsize>, delay: Duration) -> Arc<dyn JobHandler> {
        handler_fn(move |inputs| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(json!({ "inputs": inputs }))
            }
        })
    }

    #[tokio::test]
    async fn test_concurrent_misses_compute_exactly_once() {
        let orch = orchestrator();
        let counter = Arc::new(AtomicUsize::new(0));
        orch.register_job(
            "expensive",
            counting_handler(Arc::clone(&counter), Duration::from_millis(30)),
        )
        .await
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orch = Arc::clone(&orch);
            handles.push(tokio::spawn(async move {
                let scope = ScopeContext::anonymous();
                let ctx = LockContext::new();
                orch.submit(
                    "expensive",
                    vec![json!({"a": 1, "b": 2})],
                    JobOptions::default(),
                    &scope,
                    &ctx,
                )
                .await
                .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_scope_none_always_executes() {
        let orch = orchestrator();
        let counter = Arc::new(AtomicUsize::new(0));
        orch.register_job(
            "uncached",
            counting_handler(Arc::clone(&counter), Duration::ZERO),
        )
        .await
        .unwrap();

        let scope = ScopeContext::anonymous();
        let ctx = LockContext::new();
        let options = JobOptions {
            scope: CacheScope::None,
            run_as_task: false,
        };
        for _ in 0..3 {
            orch.submit("uncached", vec![json!(1)], options, &scope, &ctx)
                .await
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(orch.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_user_scopes_partition_the_cache() {
        let orch = orchestrator();
        let counter = Arc::new(AtomicUsize::new(0));
        orch.register_job(
            "per_user",
            counting_handler(Arc::clone(&counter), Duration::ZERO),
        )
        .await
        .unwrap();

        let options = JobOptions {
            scope: CacheScope::User,
            run_as_task: false,
        };
        let ctx = LockContext::new();

        let alice = ScopeContext::anonymous().with_user("alice");
        let bob = ScopeContext::anonymous().with_user("bob");
        orch.submit("per_user", vec![json!(1)], options, &alice, &ctx)
            .await
            .unwrap();
        orch.submit("per_user", vec![json!(1)], options, &bob, &ctx)
            .await
            .unwrap();
        // Same user again: cache hit, no new execution.
        orch.submit("per_user", vec![json!(1)], options, &alice, &ctx)
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_session_scope_errors() {
        let orch = orchestrator();
        let options = JobOptions {
            scope: CacheScope::Session,
            run_as_task: false,
        };
        let err = orch
            .submit(
                "whatever",
                vec![],
                options,
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingScope(_)));
    }

    #[tokio::test]
    async fn test_unknown_job_errors() {
        let orch = orchestrator();
        let err = orch
            .submit(
                "nope",
                vec![],
                JobOptions::default(),
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_run_as_task_without_pool_is_disabled() {
        let orch = orchestrator();
        let options = JobOptions {
            scope: CacheScope::Global,
            run_as_task: true,
        };
        let err = orch
            .submit(
                "offloaded",
                vec![],
                options,
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PoolDisabled));
    }

    #[tokio::test]
    async fn test_run_as_task_through_pool() {
        let pool = TaskPool::start(
            PoolConfig {
                size: 1,
                spool_dir: tempfile::tempdir().unwrap().keep(),
                ..PoolConfig::default()
            },
            Arc::new(FakeWorkerLauncher::new()),
        )
        .await
        .unwrap();

        let orch = ComputationOrchestrator::new(
            Arc::new(CacheStore::new(CachePolicy::KeepAll)),
            MultiResourceLock::new(true),
            Some(pool),
        );

        let options = JobOptions {
            scope: CacheScope::Global,
            run_as_task: true,
        };
        let value = orch
            .submit(
                "double",
                vec![json!(6)],
                options,
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!(12));

        // Second call is served from the cache.
        let again = orch
            .submit(
                "double",
                vec![json!(6)],
                options,
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(again, json!(12));
    }

    #[tokio::test]
    async fn test_failed_worker_task_surfaces_message() {
        let pool = TaskPool::start(
            PoolConfig {
                size: 1,
                spool_dir: tempfile::tempdir().unwrap().keep(),
                ..PoolConfig::default()
            },
            Arc::new(FakeWorkerLauncher::new()),
        )
        .await
        .unwrap();

        let orch = ComputationOrchestrator::new(
            Arc::new(CacheStore::new(CachePolicy::KeepAll)),
            MultiResourceLock::new(true),
            Some(pool),
        );

        let options = JobOptions {
            scope: CacheScope::Global,
            run_as_task: true,
        };
        let err = orch
            .submit(
                "fail",
                vec![],
                options,
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Task(TaskError::Failed(remote)) => {
                assert_eq!(remote.message, "intentional failure");
            }
            other => panic!("expected task failure, got {other:?}"),
        }

        // Failures are not cached.
        assert!(orch.cache().is_empty().await);
    }
}
