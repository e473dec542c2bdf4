//! Decoupled-dispatch stages: publisher completion detached from handler
//! completion.

use crate::cancellation::CancelToken;
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::Semaphore;

/// Soft decoupling: synchronous completions stay visible.
///
/// The inner future is polled once on the publisher's context. If the
/// handler completes without suspending — a validation failure before any
/// I/O, say — the publisher observes that completion, including the
/// failure. If it suspends, the remainder runs on a background task and
/// the publisher gets an immediate success; the background outcome is
/// suppressed by design.
pub struct DetachStage<M: Send + 'static> {
    next: DynHandler<M>,
}

impl<M: Send + 'static> DetachStage<M> {
    pub(crate) fn stage(next: DynHandler<M>) -> DynHandler<M> {
        Arc::new(Self { next })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for DetachStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let next = self.next.clone();
        let mut fut = Box::pin(async move { next.handle(message, cancel).await });

        let first = std::future::poll_fn(|cx| Poll::Ready(fut.as_mut().poll(cx))).await;
        match first {
            Poll::Ready(result) => result,
            Poll::Pending => {
                tokio::spawn(async move {
                    let _ = fut.await;
                });
                Ok(())
            }
        }
    }
}

/// Hard fire-and-forget: the inner handler always runs in the background.
///
/// The publisher gets an immediate success regardless of whether the
/// handler would have completed synchronously. Background failures are
/// suppressed by design.
pub struct BackgroundDetachStage<M: Send + 'static> {
    next: DynHandler<M>,
}

impl<M: Send + 'static> BackgroundDetachStage<M> {
    pub(crate) fn stage(next: DynHandler<M>) -> DynHandler<M> {
        Arc::new(Self { next })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for BackgroundDetachStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let next = self.next.clone();
        tokio::spawn(async move {
            let _ = next.handle(message, cancel).await;
        });
        Ok(())
    }
}

/// Background dispatch with a concurrency cap.
///
/// Every message is spawned immediately — the publisher never blocks — and
/// the spawned task acquires one of `max_concurrent` permits before
/// invoking the inner handler. Excess messages wait in the background for
/// a free slot; nothing is dropped. Background failures are suppressed by
/// design.
pub struct BoundedDetachStage<M: Send + 'static> {
    next: DynHandler<M>,
    permits: Arc<Semaphore>,
}

impl<M: Send + 'static> BoundedDetachStage<M> {
    pub(crate) fn stage(next: DynHandler<M>, max_concurrent: usize) -> DynHandler<M> {
        Arc::new(Self {
            next,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for BoundedDetachStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let next = self.next.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            let _ = next.handle(message, cancel).await;
        });
        Ok(())
    }
}
