//! Named, optionally-reentrant async mutual exclusion.
//!
//! This is the primitive behind the orchestrator's core guarantee: N
//! simultaneous cache-miss requests for one cache key collapse into one
//! computation plus N-1 waiters. The table is self-cleaning - an entry
//! exists iff someone holds or waits on that resource name, so a
//! high-cardinality stream of one-shot names leaves nothing behind.
//!
//! "Held by me" bookkeeping lives in an explicit [`LockContext`] carried
//! by each logical task; there is no global or thread-local state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Re-acquiring a resource already held by this context on a
    /// non-reentrant lock. Raised immediately, without blocking.
    #[error("resource '{0}' is already held by the current task")]
    Recursion(String),
}

struct Slot {
    mutex: Arc<Mutex<()>>,
    /// Holder plus queued waiters. The table entry lives iff this is > 0.
    waiters: usize,
}

struct Inner {
    reentrant: bool,
    table: StdMutex<HashMap<String, Slot>>,
}

impl Inner {
    fn drop_waiter(&self, resource: &str) {
        let mut table = self.table.lock().unwrap();
        if let Some(slot) = table.get_mut(resource) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                table.remove(resource);
            }
        }
    }
}

/// Per-logical-task bookkeeping of held resource names.
///
/// Clone the context into whatever owns the logical task (a request
/// handler, an orchestrator call chain); guards update it on acquire and
/// release.
#[derive(Clone, Default)]
pub struct LockContext {
    held: Arc<StdMutex<HashSet<String>>>,
}

impl LockContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when this context currently holds `resource`.
    pub fn holds(&self, resource: &str) -> bool {
        self.held.lock().unwrap().contains(resource)
    }
}

/// Named async mutex table.
#[derive(Clone)]
pub struct MultiResourceLock {
    inner: Arc<Inner>,
}

impl MultiResourceLock {
    /// Create a lock table. `reentrant` controls whether re-acquiring a
    /// held resource succeeds as a no-op or errors.
    pub fn new(reentrant: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                reentrant,
                table: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquire `resource` for the given context, blocking until any other
    /// holder releases it. Fairness follows the underlying mutex.
    pub async fn acquire(
        &self,
        resource: &str,
        ctx: &LockContext,
    ) -> Result<ResourceGuard, LockError> {
        if ctx.holds(resource) {
            if self.inner.reentrant {
                // Already ours; nothing to release when the guard drops.
                return Ok(ResourceGuard { inner: None });
            }
            return Err(LockError::Recursion(resource.to_string()));
        }

        let mutex = {
            let mut table = self.inner.table.lock().unwrap();
            let slot = table.entry(resource.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                waiters: 0,
            });
            slot.waiters += 1;
            Arc::clone(&slot.mutex)
        };

        // If this future is dropped mid-wait the waiter count still comes
        // back down, keeping the "entry iff waiters > 0" invariant.
        let mut waiter = Waiter {
            inner: &self.inner,
            resource,
            armed: true,
        };
        let permit = mutex.lock_owned().await;
        waiter.armed = false;

        ctx.held.lock().unwrap().insert(resource.to_string());
        Ok(ResourceGuard {
            inner: Some(GuardInner {
                lock: Arc::clone(&self.inner),
                resource: resource.to_string(),
                held: Arc::clone(&ctx.held),
                permit: Some(permit),
            }),
        })
    }

    /// Number of resource names currently in the table (held or waited
    /// on). Drains to zero between contended periods.
    pub fn resource_count(&self) -> usize {
        self.inner.table.lock().unwrap().len()
    }

    /// True when the table has an entry for `resource`.
    pub fn contains(&self, resource: &str) -> bool {
        self.inner.table.lock().unwrap().contains_key(resource)
    }
}

struct Waiter<'a> {
    inner: &'a Inner,
    resource: &'a str,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.drop_waiter(self.resource);
        }
    }
}

/// RAII guard for an acquired resource. Dropping it releases the resource
/// and removes its table entry when nobody else is waiting.
pub struct ResourceGuard {
    /// `None` for a reentrant re-acquire: the outer guard owns the release.
    inner: Option<GuardInner>,
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource", &self.inner.as_ref().map(|g| g.resource.as_str()))
            .finish()
    }
}

struct GuardInner {
    lock: Arc<Inner>,
    resource: String,
    held: Arc<StdMutex<HashSet<String>>>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.resource);
        // Release the mutex before shrinking the table so a queued waiter
        // can take over the same slot.
        self.permit.take();
        self.lock.drop_waiter(&self.resource);
    }
}
