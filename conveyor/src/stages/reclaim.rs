//! Reclaimable-reference terminal stage and its background sweeper.
//!
//! The stage stores a relation to the application handler, never
//! ownership: the chain does not keep the handler alive. Resolution
//! failure — the last strong reference elsewhere was dropped — signals
//! that the chain's job is over.

use crate::cancellation::CancelToken;
use crate::chain::{ChainServices, HandleSlot};
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Terminal stage holding a non-owning reference to the handler.
///
/// Each message attempts to resolve the reference: on success the handler
/// is invoked normally; on failure the owning chain is disposed and the
/// message dropped.
pub struct ReclaimableHandler<M: Send + 'static> {
    target: Weak<dyn Handler<M>>,
    owner: HandleSlot,
}

impl<M: Send + 'static> ReclaimableHandler<M> {
    pub(crate) fn stage(
        target: Weak<dyn Handler<M>>,
        sweeper: &Arc<ReclamationSweeper>,
        services: &ChainServices,
    ) -> DynHandler<M> {
        let owner = HandleSlot::new();
        owner.attach(services);

        let probe_target = target.clone();
        sweeper.register(move || probe_target.strong_count() > 0, owner.clone());

        Arc::new(Self { target, owner })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for ReclaimableHandler<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        match self.target.upgrade() {
            Some(handler) => handler.handle(message, cancel).await,
            None => {
                self.owner.dispose();
                Ok(())
            }
        }
    }
}

struct SweepEntry {
    alive: Box<dyn Fn() -> bool + Send + Sync>,
    slot: HandleSlot,
}

/// Shared background sweeper for reclaimable stages.
///
/// Polls every registered liveness probe on a fixed interval and disposes
/// chains whose target has become unreachable, ensuring timely cleanup
/// even with no traffic flowing. Disposed and reclaimed entries are
/// pruned from the registry.
pub struct ReclamationSweeper {
    interval: Duration,
    entries: Mutex<Vec<SweepEntry>>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReclamationSweeper {
    /// Creates a sweeper polling at the given interval. Call
    /// [`start`](Self::start) to begin sweeping.
    #[must_use]
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            entries: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub(crate) fn register<F>(&self, alive: F, slot: HandleSlot)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.entries.lock().push(SweepEntry {
            alive: Box::new(alive),
            slot,
        });
    }

    /// Returns the number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no entries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Starts the background sweep task.
    ///
    /// Idempotent: calling `start` on a running sweeper is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let sweeper = self.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweeper.sweep();
            }
        }));
    }

    /// Stops the background sweep task.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    /// Runs one sweep pass.
    ///
    /// Exposed so callers can force a pass without waiting for the
    /// interval.
    pub fn sweep(&self) {
        // Disposal callbacks can take other locks; run them outside ours.
        let mut reclaimed = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|entry| {
                let Some(handle) = entry.slot.get() else {
                    return true;
                };
                if handle.is_disposed() {
                    return false;
                }
                if (entry.alive)() {
                    return true;
                }
                reclaimed.push(handle);
                false
            });
        }

        for handle in reclaimed {
            tracing::debug!(chain_id = %handle.id(), "handler target reclaimed; disposing chain");
            handle.dispose();
        }
    }
}

impl std::fmt::Debug for ReclamationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclamationSweeper")
            .field("interval", &self.interval)
            .field("entries", &self.len())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
