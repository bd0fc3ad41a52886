//! Generic keyed stores with duplicate-key policy and live size metrics.
//!
//! A `Registry` replaces what would otherwise be a process-global map: the
//! [`crate::runtime::Runtime`] owns one instance per concern and tests
//! construct fresh ones. Every mutation updates a running deep-size
//! estimate and reports it to a metrics sink; sink failures are logged and
//! swallowed, never surfaced to the caller.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// `register` on an existing key with duplicates disallowed.
    #[error("duplicate key '{key}' in registry '{name}'")]
    DuplicateKey { name: String, key: String },

    /// Lookup or removal of an absent key.
    #[error("key '{key}' not found in registry '{name}'")]
    NotFound { name: String, key: String },
}

/// Best-effort deep size estimate in bytes.
///
/// Estimates are used only for observability. They are updated
/// incrementally on every mutation; the backing map is never rescanned.
pub trait EstimateSize {
    /// Estimated heap + inline footprint of the value.
    fn estimate_size(&self) -> usize;
}

impl EstimateSize for String {
    fn estimate_size(&self) -> usize {
        std::mem::size_of::<String>() + self.len()
    }
}

impl EstimateSize for Vec<u8> {
    fn estimate_size(&self) -> usize {
        std::mem::size_of::<Vec<u8>>() + self.len()
    }
}

impl EstimateSize for serde_json::Value {
    fn estimate_size(&self) -> usize {
        use serde_json::Value;
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Null | Value::Bool(_) | Value::Number(_) => inline,
            Value::String(s) => inline + s.len(),
            Value::Array(items) => {
                inline + items.iter().map(EstimateSize::estimate_size).sum::<usize>()
            }
            Value::Object(map) => {
                inline
                    + map
                        .iter()
                        .map(|(k, v)| k.len() + v.estimate_size())
                        .sum::<usize>()
            }
        }
    }
}

impl<T: EstimateSize> EstimateSize for Arc<T> {
    fn estimate_size(&self) -> usize {
        std::mem::size_of::<Arc<T>>() + T::estimate_size(self)
    }
}

/// Observability sink for registry size reports.
///
/// Implementations may fail; the registry logs and discards the failure.
pub trait MetricsSink: Send + Sync {
    /// Record the current entry count and byte estimate of a registry.
    fn record_registry_size(
        &self,
        name: &str,
        entries: usize,
        bytes: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Default sink: structured `tracing` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_registry_size(
        &self,
        name: &str,
        entries: usize,
        bytes: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        debug!(registry = name, entries, bytes, "Registry size");
        Ok(())
    }
}

/// Generic keyed store with duplicate-key policy and a running size
/// estimate.
pub struct Registry<K, V> {
    name: String,
    allow_duplicates: bool,
    entries: HashMap<K, V>,
    size: usize,
    sink: Arc<dyn MetricsSink>,
}

impl<K, V> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("allow_duplicates", &self.allow_duplicates)
            .field("entries", &self.entries.len())
            .field("size", &self.size)
            .finish()
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + fmt::Display,
    V: EstimateSize,
{
    /// Create a registry reporting to the default tracing sink.
    pub fn new(name: impl Into<String>, allow_duplicates: bool) -> Self {
        Self::with_sink(name, allow_duplicates, Arc::new(TracingSink))
    }

    /// Create a registry with an explicit metrics sink.
    pub fn with_sink(
        name: impl Into<String>,
        allow_duplicates: bool,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            name: name.into(),
            allow_duplicates,
            entries: HashMap::new(),
            size: 0,
            sink,
        }
    }

    /// Registry name (used in errors and metrics).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current byte-size estimate.
    pub fn size_estimate(&self) -> usize {
        self.size
    }

    /// True when the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a new entry. Fails with [`RegistryError::DuplicateKey`] when
    /// the key exists and duplicates are disallowed; otherwise behaves as
    /// an upsert.
    pub fn register(&mut self, key: K, value: V) -> Result<(), RegistryError> {
        if !self.allow_duplicates && self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateKey {
                name: self.name.clone(),
                key: key.to_string(),
            });
        }
        self.upsert(key, value);
        Ok(())
    }

    /// Upsert an entry. Never fails; size accounting reflects only the new
    /// value after a replacement.
    pub fn set(&mut self, key: K, value: V) {
        self.upsert(key, value);
    }

    /// Look up an entry.
    pub fn get(&self, key: &K) -> Result<&V, RegistryError> {
        self.entries.get(key).ok_or_else(|| RegistryError::NotFound {
            name: self.name.clone(),
            key: key.to_string(),
        })
    }

    /// Remove an entry; fails when absent.
    pub fn remove(&mut self, key: &K) -> Result<V, RegistryError> {
        let value = self.entries.remove(key).ok_or_else(|| RegistryError::NotFound {
            name: self.name.clone(),
            key: key.to_string(),
        })?;
        self.size = self.size.saturating_sub(value.estimate_size());
        self.report();
        Ok(value)
    }

    /// Swap the entire backing map atomically (test isolation, hot
    /// reload). The size estimate is recomputed once from the new map.
    pub fn replace(&mut self, entries: HashMap<K, V>) {
        self.size = entries.values().map(EstimateSize::estimate_size).sum();
        self.entries = entries;
        self.report();
    }

    fn upsert(&mut self, key: K, value: V) {
        let added = value.estimate_size();
        if let Some(old) = self.entries.insert(key, value) {
            self.size = self.size.saturating_sub(old.estimate_size());
        }
        self.size += added;
        self.report();
    }

    fn report(&self) {
        if let Err(e) =
            self.sink
                .record_registry_size(&self.name, self.entries.len(), self.size)
        {
            // Metrics must never take the caller down.
            warn!(registry = %self.name, error = %e, "Metrics sink failed; ignoring");
        }
    }
}
