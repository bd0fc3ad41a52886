//! Async key/value cache with pluggable eviction and pin semantics.
//!
//! Each store is parameterized by exactly one [`CachePolicy`], fixed for
//! its lifetime. Eviction is lazy: expired entries are dropped when an
//! access touches them, never by a background sweep. Pinned entries are
//! never eviction candidates; a pin survives until the first successful
//! `get` (one-shot protection for freshly computed results).

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Cache errors (strict-mode lookups only; plain `get` treats absence as a
/// normal return value).
#[derive(Debug, Error)]
pub enum CacheError {
    /// Strict lookup of an absent (or expired) key.
    #[error("cache key not found: {0}")]
    NotFound(String),
}

/// Eviction policy, immutable for the store's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never evict.
    KeepAll,
    /// Entries expire this long after they were set.
    Ttl(Duration),
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    pinned: bool,
    stored_at: Instant,
}

/// Async keyed cache. All operations are serialized by an internal lock;
/// there are no partial reads or writes under concurrent access.
#[derive(Debug)]
pub struct CacheStore<V> {
    policy: CachePolicy,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> CacheStore<V> {
    /// Create a store with the given policy.
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The store's eviction policy.
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Look up a key. Absence (including lazy-expired entries) is a normal
    /// `None`. A successful read unpins the entry: the pin protected it
    /// until someone actually observed the value.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        self.read(&mut entries, key, true)
    }

    /// Look up a key without consuming its pin.
    pub async fn peek(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        self.read(&mut entries, key, false)
    }

    /// Strict lookup: absence is an error.
    pub async fn get_strict(&self, key: &str) -> Result<V, CacheError> {
        self.get(key)
            .await
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    /// Insert or replace a value. `pin` grants one-shot eviction immunity
    /// until the first successful `get`.
    pub async fn set(&self, key: impl Into<String>, value: V, pin: bool) {
        let key = key.into();
        let mut entries = self.entries.lock().await;
        trace!(key = %key, pin, "Cache set");
        entries.insert(
            key,
            Entry {
                value,
                pinned: pin,
                stored_at: Instant::now(),
            },
        );
    }

    /// Remove a key. Removing an absent key is a no-op.
    pub async fn delete(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Drop all entries, pinned or not.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of live (unexpired or pinned) entries.
    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let policy = self.policy;
        entries.retain(|_, e| e.pinned || !Self::expired(policy, e));
        entries.len()
    }

    /// True when the store holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn read(
        &self,
        entries: &mut HashMap<String, Entry<V>>,
        key: &str,
        unpin: bool,
    ) -> Option<V> {
        let entry = entries.get_mut(key)?;
        if !entry.pinned && Self::expired(self.policy, entry) {
            entries.remove(key);
            return None;
        }
        if unpin {
            entry.pinned = false;
        }
        Some(entry.value.clone())
    }

    fn expired(policy: CachePolicy, entry: &Entry<V>) -> bool {
        match policy {
            CachePolicy::KeepAll => false,
            CachePolicy::Ttl(ttl) => entry.stored_at.elapsed() > ttl,
        }
    }
}
