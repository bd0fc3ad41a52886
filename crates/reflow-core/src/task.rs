//! Task payload types.

use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Serializable description of a unit of work handed to a worker.
///
/// The payload travels out-of-band through the shared payload channel;
/// only a reference to it crosses the control queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Name of the task-module function to execute.
    pub function_name: String,

    /// Positional arguments, in argument order.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskPayload {
    /// Create a new payload with no arguments.
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Builder method to append a positional argument.
    pub fn with_arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    /// Builder method to set a keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Encode the payload for the shared payload channel.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a payload read from the shared payload channel.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Terminal outcome of a task: a JSON value or a task error.
///
/// Cloneable so a single outcome fans out to every awaiter.
pub type TaskOutcome = Result<Value, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_roundtrip() {
        let payload = TaskPayload::new("render_chart")
            .with_arg(json!({"rows": [1, 2, 3]}))
            .with_kwarg("theme", json!("dark"));

        let bytes = payload.to_bytes().unwrap();
        let decoded = TaskPayload::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.function_name, "render_chart");
    }

    #[test]
    fn test_payload_defaults() {
        let decoded: TaskPayload =
            serde_json::from_str(r#"{"function_name": "noop"}"#).unwrap();
        assert!(decoded.args.is_empty());
        assert!(decoded.kwargs.is_empty());
    }
}
