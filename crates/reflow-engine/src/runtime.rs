//! Runtime root object.
//!
//! One `Runtime` per host process: it owns the computed-value cache, the
//! per-key lock table, the optional worker pool and the shutdown chain,
//! and hands out the orchestrator that ties them together. Tests build
//! isolated runtimes instead of sharing process state.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::RuntimeConfig;
use crate::lock::MultiResourceLock;
use crate::orchestrator::{ComputationOrchestrator, JobHandler};
use crate::pool::{PoolError, TaskPool, WorkerLauncher};
use crate::registry::RegistryError;
use crate::shutdown::ShutdownHooks;

/// Owns every engine subsystem for one host process.
pub struct Runtime {
    orchestrator: Arc<ComputationOrchestrator>,
    pool: Option<TaskPool>,
    hooks: ShutdownHooks,
}

impl Runtime {
    /// Start a runtime, launching real worker processes when the config
    /// carries a pool section.
    pub async fn start(config: RuntimeConfig) -> Result<Self, PoolError> {
        let pool = match &config.pool {
            Some(pool_config) => Some(TaskPool::start_with_processes(pool_config.clone()).await?),
            None => None,
        };
        Ok(Self::assemble(config, pool))
    }

    /// Start a runtime with a custom worker launcher (in-process workers
    /// in tests, alternative transports in hosts).
    pub async fn start_with_launcher(
        config: RuntimeConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, PoolError> {
        let pool = match &config.pool {
            Some(pool_config) => Some(TaskPool::start(pool_config.clone(), launcher).await?),
            None => None,
        };
        Ok(Self::assemble(config, pool))
    }

    fn assemble(config: RuntimeConfig, pool: Option<TaskPool>) -> Self {
        let cache = Arc::new(CacheStore::new(config.cache_policy));
        let locks = MultiResourceLock::new(config.reentrant_locks);
        let orchestrator = Arc::new(ComputationOrchestrator::new(
            cache,
            locks,
            pool.clone(),
        ));

        let hooks = ShutdownHooks::new();
        if let Some(pool) = &pool {
            // Interrupt path (signal handler): cancel awaiters immediately
            // rather than draining in-flight work.
            let pool = pool.clone();
            hooks.register("task-pool-interrupt", move || {
                let pool = pool.clone();
                async move { pool.interrupt() }
            });
        }

        info!(pooled = pool.is_some(), "Runtime started");
        Self {
            orchestrator,
            pool,
            hooks,
        }
    }

    /// The computation orchestrator.
    pub fn orchestrator(&self) -> &Arc<ComputationOrchestrator> {
        &self.orchestrator
    }

    /// The worker pool, when offloading is enabled.
    pub fn pool(&self) -> Option<&TaskPool> {
        self.pool.as_ref()
    }

    /// The shutdown hook chain. Hosts register their own teardown here.
    pub fn hooks(&self) -> &ShutdownHooks {
        &self.hooks
    }

    /// Register an inline job handler.
    pub async fn register_job(
        &self,
        job_id: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        self.orchestrator.register_job(job_id, handler).await
    }

    /// The computed-value cache.
    pub fn cache(&self) -> &Arc<CacheStore<Value>> {
        self.orchestrator.cache()
    }

    /// Graceful shutdown: stop accepting work, drain in-flight tasks, then
    /// run the hook chain.
    pub async fn shutdown(&self) {
        info!("Runtime shutting down");
        if let Some(pool) = &self.pool {
            pool.stop().await;
        }
        self.hooks.run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::lock::LockContext;
    use crate::orchestrator::{handler_fn, JobOptions, OrchestratorError};
    use crate::pool::testing::FakeWorkerLauncher;
    use reflow_core::{CacheScope, ScopeContext};
    use serde_json::json;

    fn poolless_config() -> RuntimeConfig {
        RuntimeConfig {
            pool: None,
            ..RuntimeConfig::default()
        }
    }

    fn pooled_config() -> RuntimeConfig {
        RuntimeConfig {
            pool: Some(PoolConfig {
                size: 2,
                spool_dir: tempfile::tempdir().unwrap().keep(),
                ..PoolConfig::default()
            }),
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_inline_job_through_runtime() {
        let rt = Runtime::start(poolless_config()).await.unwrap();
        rt.register_job(
            "add",
            handler_fn(|inputs| async move {
                let sum: i64 = inputs.iter().filter_map(|v| v.as_i64()).sum();
                Ok(json!(sum))
            }),
        )
        .await
        .unwrap();

        let value = rt
            .orchestrator()
            .submit(
                "add",
                vec![json!(2), json!(3)],
                JobOptions::default(),
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!(5));
        assert_eq!(rt.cache().len().await, 1);
    }

    #[tokio::test]
    async fn test_poolless_runtime_rejects_offloading() {
        let rt = Runtime::start(poolless_config()).await.unwrap();
        let err = rt
            .orchestrator()
            .submit(
                "anything",
                vec![],
                JobOptions {
                    scope: CacheScope::Global,
                    run_as_task: true,
                },
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PoolDisabled));
    }

    #[tokio::test]
    async fn test_pooled_runtime_offloads_and_shuts_down() {
        let rt = Runtime::start_with_launcher(pooled_config(), Arc::new(FakeWorkerLauncher::new()))
            .await
            .unwrap();
        assert!(rt.pool().is_some());
        assert_eq!(rt.hooks().len(), 1);

        let value = rt
            .orchestrator()
            .submit(
                "double",
                vec![json!(21)],
                JobOptions {
                    scope: CacheScope::Global,
                    run_as_task: true,
                },
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!(42));

        rt.shutdown().await;

        // No submissions after shutdown.
        let payload = reflow_core::TaskPayload::new("double").with_arg(json!(1));
        assert!(matches!(
            rt.pool().unwrap().submit(&payload),
            Err(PoolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_isolated_runtimes_share_nothing() {
        let a = Runtime::start(poolless_config()).await.unwrap();
        let b = Runtime::start(poolless_config()).await.unwrap();

        a.register_job("job", handler_fn(|_| async { Ok(json!("a")) }))
            .await
            .unwrap();

        a.orchestrator()
            .submit(
                "job",
                vec![],
                JobOptions::default(),
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap();

        // b never registered the job and never saw a's cache fill.
        assert!(b.cache().is_empty().await);
        let err = b
            .orchestrator()
            .submit(
                "job",
                vec![],
                JobOptions::default(),
                &ScopeContext::anonymous(),
                &LockContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownJob(_)));
    }
}
