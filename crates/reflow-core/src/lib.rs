//! Reflow Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - The async runtime
//! - Process/IPC plumbing
//! - Any I/O
//!
//! Everything here is shared between the control plane (`reflow-engine`)
//! and the worker side (`reflow-worker`).

pub mod cachekey;
pub mod error;
pub mod ids;
pub mod scope;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use cachekey::{cache_key, canonical_json};
pub use error::{RemoteError, TaskError};
pub use ids::{RegionId, TaskUid};
pub use scope::{CacheScope, ScopeContext};
pub use status::{PoolState, WorkerState};
pub use task::{TaskOutcome, TaskPayload};
