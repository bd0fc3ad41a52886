//! Wire protocol between the task pool and its worker processes.
//!
//! The control queue carries small, newline-delimited JSON frames
//! ([`messages`]); large task payloads and results travel out-of-band
//! through the [`payload`] channel, referenced by handle.

pub mod messages;
pub mod payload;

pub use messages::{PoolMessage, WorkerMessage};
pub use payload::{PayloadError, PayloadRef, SharedPayloadChannel};
