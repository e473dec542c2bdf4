//! Disposable handle attached to every compiled chain.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Handle used to tear down a compiled chain.
///
/// `dispose` is idempotent: the second and later calls are no-ops. After
/// disposal the chain drops subsequently received messages without
/// invoking the terminal handler (best-effort — in-flight executions may
/// still complete).
///
/// Cloned handles share state; interior stages obtain one through the
/// lifecycle notifier and use it to terminate the pipeline from within.
#[derive(Clone)]
pub struct ChainHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: Uuid,
    disposed: AtomicBool,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandle")
            .field("id", &self.inner.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ChainHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                disposed: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the chain's unique id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns true if the chain has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Disposes the chain.
    ///
    /// The first call runs every registered `on_dispose` callback in
    /// registration order; later calls are no-ops.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            tracing::trace!(chain_id = %self.inner.id, "chain disposed");

            let callbacks: Vec<_> = {
                let mut lock = self.inner.callbacks.lock();
                std::mem::take(&mut *lock)
            };
            for callback in callbacks {
                callback();
            }
        }
    }

    /// Registers a callback to run when the chain is disposed.
    ///
    /// If the chain is already disposed, the callback runs immediately.
    /// Used for cascading teardown between linked chains.
    pub fn on_dispose<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut lock = self.inner.callbacks.lock();
            if !self.is_disposed() {
                lock.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}
