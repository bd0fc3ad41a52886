//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CachePolicy;

/// Task pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub size: usize,

    /// Worker binary to launch (PATH lookup or full path).
    pub worker_binary: PathBuf,

    /// Task module the workers serve.
    pub task_module: String,

    /// Spool directory for the shared payload channel.
    pub spool_dir: PathBuf,

    /// Dispatch queue depth.
    pub queue_capacity: usize,

    /// How long a freshly launched worker may take to initialize.
    pub init_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            worker_binary: PathBuf::from("reflow-worker"),
            task_module: "default".to_string(),
            spool_dir: std::env::temp_dir().join("reflow-spool"),
            queue_capacity: 256,
            init_timeout: Duration::from_secs(10),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Eviction policy for the computed-value cache.
    pub cache_policy: CachePolicy,

    /// Whether per-key locks tolerate reentrant acquisition.
    pub reentrant_locks: bool,

    /// Pool settings; `None` disables process offloading (jobs marked
    /// `run_as_task` fail to submit).
    pub pool: Option<PoolConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_policy: CachePolicy::KeepAll,
            reentrant_locks: true,
            pool: Some(PoolConfig::default()),
        }
    }
}
