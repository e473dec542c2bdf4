//! Lifecycle notification bridging stage construction and handle
//! availability.
//!
//! A stage instantiated during compilation may need the handle of the
//! chain it is part of — a forward reference, since the handle only exists
//! once compilation finishes. The notifier is a one-shot, single-publisher
//! event: callbacks registered during a single compile all receive the
//! finished handle, in registration order, before the chain can see its
//! first message.

use super::handle::ChainHandle;
use parking_lot::Mutex;
use std::sync::Arc;

/// One-shot callback registry drained exactly once at the end of
/// compilation.
#[derive(Default)]
pub struct LifecycleNotifier {
    callbacks: Mutex<Vec<Box<dyn FnOnce(ChainHandle) + Send>>>,
    notified: Mutex<Option<ChainHandle>>,
}

impl LifecycleNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a callback to receive the finished chain handle.
    ///
    /// Registration after notification invokes the callback immediately.
    pub fn register<F>(&self, callback: F)
    where
        F: FnOnce(ChainHandle) + Send + 'static,
    {
        let handle = {
            let notified = self.notified.lock();
            match notified.as_ref() {
                Some(handle) => handle.clone(),
                None => {
                    self.callbacks.lock().push(Box::new(callback));
                    return;
                }
            }
        };
        callback(handle);
    }

    /// Publishes the finished handle to every registered callback.
    ///
    /// Invoked exactly once, immediately after compilation produces the
    /// handle.
    pub(crate) fn notify(&self, handle: ChainHandle) {
        *self.notified.lock() = Some(handle.clone());

        let callbacks: Vec<_> = {
            let mut lock = self.callbacks.lock();
            std::mem::take(&mut *lock)
        };
        for callback in callbacks {
            callback(handle.clone());
        }
    }
}

impl std::fmt::Debug for LifecycleNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleNotifier")
            .field("pending", &self.callbacks.lock().len())
            .field("notified", &self.notified.lock().is_some())
            .finish()
    }
}

/// Services made available to stage factories during compilation.
#[derive(Debug)]
pub struct ChainServices {
    notifier: LifecycleNotifier,
}

impl ChainServices {
    pub(crate) fn new() -> Self {
        Self {
            notifier: LifecycleNotifier::new(),
        }
    }

    /// Returns the lifecycle notifier for this compilation.
    #[must_use]
    pub fn notifier(&self) -> &LifecycleNotifier {
        &self.notifier
    }
}

/// Shared cell a self-disposing stage fills with its own chain handle.
///
/// The stage attaches the slot during construction; the notifier fills it
/// when compilation finishes. Disposing an empty slot is a no-op.
#[derive(Clone, Default)]
pub struct HandleSlot {
    inner: Arc<Mutex<Option<ChainHandle>>>,
}

impl HandleSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers this slot to be filled when the chain handle exists.
    pub fn attach(&self, services: &ChainServices) {
        let slot = self.clone();
        services.notifier().register(move |handle| {
            *slot.inner.lock() = Some(handle);
        });
    }

    /// Returns the handle if the slot has been filled.
    #[must_use]
    pub fn get(&self) -> Option<ChainHandle> {
        self.inner.lock().clone()
    }

    /// Disposes the owning chain if the slot has been filled.
    pub fn dispose(&self) {
        if let Some(handle) = self.get() {
            handle.dispose();
        }
    }
}

impl std::fmt::Debug for HandleSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleSlot")
            .field("filled", &self.inner.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let notifier = LifecycleNotifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            notifier.register(move |_| order.lock().push(i));
        }

        notifier.notify(ChainHandle::new());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let notifier = LifecycleNotifier::new();
        notifier.notify(ChainHandle::new());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        notifier.register(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_slot_fills_on_notify() {
        let services = ChainServices::new();
        let slot = HandleSlot::new();
        slot.attach(&services);

        assert!(slot.get().is_none());
        slot.dispose();

        let handle = ChainHandle::new();
        services.notifier().notify(handle.clone());

        assert!(slot.get().is_some());
        slot.dispose();
        assert!(handle.is_disposed());
    }
}
