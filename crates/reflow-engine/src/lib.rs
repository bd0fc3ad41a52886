//! Reflow Control Plane
//!
//! The value computation and execution subsystem: keyed cache with
//! pluggable eviction, per-key mutual exclusion that collapses duplicate
//! work, generic registries with live size metrics, a multi-process task
//! pool, and the orchestrator that ties them together.
//!
//! Everything in this crate runs on the host's tokio event loop; worker
//! processes are true OS processes reached only through the typed message
//! protocol and the shared payload channel in `reflow-proto`.

pub mod cache;
pub mod config;
pub mod lock;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod shutdown;

pub use cache::{CacheError, CachePolicy, CacheStore};
pub use config::{PoolConfig, RuntimeConfig};
pub use lock::{LockContext, LockError, MultiResourceLock, ResourceGuard};
pub use orchestrator::{
    handler_fn, ComputationOrchestrator, JobHandler, JobOptions, OrchestratorError,
};
pub use pool::{
    PoolError, ProcessLauncher, ProgressUpdate, TaskPool, TaskTicket, WorkerChannel,
    WorkerLauncher, WorkerParameters,
};
pub use registry::{EstimateSize, MetricsSink, Registry, RegistryError, TracingSink};
pub use runtime::Runtime;
pub use shutdown::ShutdownHooks;
