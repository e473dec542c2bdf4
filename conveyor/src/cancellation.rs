//! Cancellation token threaded through every handler invocation.
//!
//! Every dispatch carries a [`CancelToken`]; stages propagate it unchanged
//! to the inner handler. A cancellation-triggered failure is never retried
//! or swallowed by intermediate stages.

use crate::errors::DispatchError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Token for coordinating cancellation across an in-flight dispatch.
///
/// Cheap to clone; all clones observe the same cancellation state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    callbacks: Mutex<Vec<Box<dyn FnOnce(String) + Send>>>,
    notify: Notify,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Requests cancellation with a reason.
    ///
    /// Idempotent: only the first reason is stored, callbacks run once.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();

        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            *self.inner.reason.lock() = Some(reason.clone());

            let callbacks: Vec<_> = {
                let mut lock = self.inner.callbacks.lock();
                std::mem::take(&mut *lock)
            };
            for callback in callbacks {
                callback(reason.clone());
            }

            self.inner.notify.notify_waiters();
        }
    }

    /// Registers a callback to run when cancellation is requested.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        {
            let mut lock = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                lock.push(Box::new(callback));
                return;
            }
        }
        callback(self.reason().unwrap_or_default());
    }

    /// Resolves once cancellation is requested.
    ///
    /// Resolves immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Converts the token's current state into a dispatch failure.
    #[must_use]
    pub fn to_error(&self) -> DispatchError {
        DispatchError::cancelled(self.reason().unwrap_or_else(|| "cancelled".to_string()))
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
