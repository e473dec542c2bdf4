//! Count- and predicate-bounded stages.
//!
//! Each stage is a small admission state machine guarded by an atomic, so
//! the transition happens exactly once even under concurrent delivery.
//! The self-disposing variants obtain their own chain handle through the
//! lifecycle notifier and tear the pipeline down from the inside.

use crate::cancellation::CancelToken;
use crate::chain::{ChainServices, HandleSlot};
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Admits the first `count` messages, then disposes its own chain.
///
/// The n+1th delivery attempt performs the disposal and drops its message;
/// later attempts are no-ops (the disposal gate drops them).
pub struct TakeStage<M: Send + 'static> {
    next: DynHandler<M>,
    remaining: AtomicI64,
    owner: HandleSlot,
}

impl<M: Send + 'static> TakeStage<M> {
    pub(crate) fn stage(next: DynHandler<M>, count: i64, services: &ChainServices) -> DynHandler<M> {
        let owner = HandleSlot::new();
        owner.attach(services);
        Arc::new(Self {
            next,
            remaining: AtomicI64::new(count),
            owner,
        })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for TakeStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let previous = self.remaining.fetch_sub(1, Ordering::SeqCst);
        if previous > 0 {
            return self.next.handle(message, cancel).await;
        }
        if previous == 0 {
            // Exactly one delivery observes the exhausted counter.
            self.owner.dispose();
        }
        Ok(())
    }
}

/// Admits messages while the predicate holds; the first failing message is
/// dropped and the chain disposed. The predicate is never re-evaluated
/// once the flag flips.
pub struct TakeWhileStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    next: DynHandler<M>,
    predicate: P,
    done: AtomicBool,
    owner: HandleSlot,
}

impl<M, P> TakeWhileStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    pub(crate) fn stage(
        next: DynHandler<M>,
        predicate: P,
        services: &ChainServices,
    ) -> DynHandler<M> {
        let owner = HandleSlot::new();
        owner.attach(services);
        Arc::new(Self {
            next,
            predicate,
            done: AtomicBool::new(false),
            owner,
        })
    }
}

#[async_trait]
impl<M, P> Handler<M> for TakeWhileStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        if self.done.load(Ordering::SeqCst) {
            return Ok(());
        }
        if (self.predicate)(&message) {
            return self.next.handle(message, cancel).await;
        }
        if !self.done.swap(true, Ordering::SeqCst) {
            self.owner.dispose();
        }
        Ok(())
    }
}

/// Drops the first `count` messages, admits the rest indefinitely.
pub struct SkipStage<M: Send + 'static> {
    next: DynHandler<M>,
    remaining: AtomicI64,
}

impl<M: Send + 'static> SkipStage<M> {
    pub(crate) fn stage(next: DynHandler<M>, count: i64) -> DynHandler<M> {
        Arc::new(Self {
            next,
            remaining: AtomicI64::new(count),
        })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for SkipStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let skipped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                (remaining > 0).then_some(remaining - 1)
            })
            .is_ok();
        if skipped {
            Ok(())
        } else {
            self.next.handle(message, cancel).await
        }
    }
}

/// Drops messages while the predicate holds; once it first fails, admits
/// everything without re-evaluating.
pub struct SkipWhileStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    next: DynHandler<M>,
    predicate: P,
    flipped: AtomicBool,
}

impl<M, P> SkipWhileStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    pub(crate) fn stage(next: DynHandler<M>, predicate: P) -> DynHandler<M> {
        Arc::new(Self {
            next,
            predicate,
            flipped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl<M, P> Handler<M> for SkipWhileStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        if self.flipped.load(Ordering::SeqCst) {
            return self.next.handle(message, cancel).await;
        }
        if (self.predicate)(&message) {
            return Ok(());
        }
        self.flipped.store(true, Ordering::SeqCst);
        self.next.handle(message, cancel).await
    }
}

/// Delivers only the first message matching the predicate, then disposes.
///
/// A compare-and-swap guard admits exactly one message even when matching
/// messages arrive concurrently.
pub struct FirstStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    next: DynHandler<M>,
    predicate: P,
    claimed: AtomicBool,
    owner: HandleSlot,
}

impl<M, P> FirstStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    pub(crate) fn stage(
        next: DynHandler<M>,
        predicate: P,
        services: &ChainServices,
    ) -> DynHandler<M> {
        let owner = HandleSlot::new();
        owner.attach(services);
        Arc::new(Self {
            next,
            predicate,
            claimed: AtomicBool::new(false),
            owner,
        })
    }
}

#[async_trait]
impl<M, P> Handler<M> for FirstStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        if self.claimed.load(Ordering::SeqCst) || !(self.predicate)(&message) {
            return Ok(());
        }
        if self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.next.handle(message, cancel).await;
        self.owner.dispose();
        result
    }
}
