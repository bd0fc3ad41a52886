//! Ordered shutdown hook chain.
//!
//! Hosts often install their own teardown logic before the engine does.
//! Instead of replacing a signal handler, everyone registers a hook; on
//! shutdown the chain runs each hook to completion in registration order,
//! at most once for the life of the chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{info, warn};

type Hook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Inner {
    hooks: StdMutex<Vec<(String, Hook)>>,
    fired: StdMutex<bool>,
}

/// Ordered, run-once collection of async shutdown hooks.
#[derive(Clone)]
pub struct ShutdownHooks {
    inner: Arc<Inner>,
}

impl Default for ShutdownHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHooks {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                hooks: StdMutex::new(Vec::new()),
                fired: StdMutex::new(false),
            }),
        }
    }

    /// Append a hook. Hooks run in registration order.
    pub fn register<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut hooks = self.inner.hooks.lock().unwrap();
        hooks.push((name, Box::new(move || Box::pin(hook()))));
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.inner.hooks.lock().unwrap().len()
    }

    /// True when no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the chain. Each hook is awaited before the next starts; a
    /// second call is a no-op.
    pub async fn run(&self) {
        {
            let mut fired = self.inner.fired.lock().unwrap();
            if *fired {
                warn!("Shutdown chain already ran; ignoring");
                return;
            }
            *fired = true;
        }

        // Take the futures out while holding the lock, await them after.
        let pending: Vec<(String, Pin<Box<dyn Future<Output = ()> + Send>>)> = {
            let hooks = self.inner.hooks.lock().unwrap();
            hooks.iter().map(|(name, h)| (name.clone(), h())).collect()
        };

        for (name, fut) in pending {
            info!(hook = %name, "Running shutdown hook");
            fut.await;
        }
    }

    /// Spawn a listener that runs the chain when the process receives an
    /// interrupt signal. Composes with host handlers: they register hooks
    /// here rather than installing their own signal handler.
    pub fn listen_for_interrupt(&self) -> tokio::task::JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received; running shutdown chain");
                    chain.run().await;
                }
                Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
            }
        })
    }
}
