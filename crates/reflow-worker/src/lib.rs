//! Reflow worker process.
//!
//! The pool-facing half lives in `reflow-engine`; this crate is the other
//! end of the wire. A worker loads one named task module, announces itself
//! with an initialization frame, then executes task assignments from stdin
//! one at a time, streaming progress and results back over stdout. Stdin
//! EOF is the graceful-shutdown signal.

pub mod module;
pub mod runloop;

pub use module::{task_fn, ModuleError, ProgressReporter, TaskFn, TaskModule};
pub use runloop::{run, WorkerError};
