//! Same-type filtering and derived-type bridge handlers.
//!
//! Type-changing stages are sub-builder bridges: the fluent surface on
//! [`ChainBuilder`](crate::chain::ChainBuilder) builds and compiles an
//! inner chain of the new type, and the handlers here translate and
//! forward into it. Dropping a message here is silent by design, not a
//! failure.

use crate::cancellation::CancelToken;
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use std::sync::Arc;

/// Forwards only messages matching the predicate.
pub struct FilterStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    next: DynHandler<M>,
    predicate: P,
}

impl<M, P> FilterStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    pub(crate) fn stage(next: DynHandler<M>, predicate: P) -> DynHandler<M> {
        Arc::new(Self { next, predicate })
    }
}

#[async_trait]
impl<M, P> Handler<M> for FilterStage<M, P>
where
    M: Send + 'static,
    P: Fn(&M) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        if (self.predicate)(&message) {
            self.next.handle(message, cancel).await
        } else {
            Ok(())
        }
    }
}

/// Translates each message and forwards it into the inner chain.
pub struct MapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> N + Send + Sync + 'static,
{
    inner: DynHandler<N>,
    transform: F,
    _marker: std::marker::PhantomData<fn(M)>,
}

impl<M, N, F> MapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> N + Send + Sync + 'static,
{
    pub(crate) fn stage(inner: DynHandler<N>, transform: F) -> DynHandler<M> {
        Arc::new(Self {
            inner,
            transform,
            _marker: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<M, N, F> Handler<M> for MapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> N + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        self.inner.handle((self.transform)(message), cancel).await
    }
}

/// Filter-and-cast bridge: `None` drops the message.
pub struct FilterMapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> Option<N> + Send + Sync + 'static,
{
    inner: DynHandler<N>,
    transform: F,
    _marker: std::marker::PhantomData<fn(M)>,
}

impl<M, N, F> FilterMapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> Option<N> + Send + Sync + 'static,
{
    pub(crate) fn stage(inner: DynHandler<N>, transform: F) -> DynHandler<M> {
        Arc::new(Self {
            inner,
            transform,
            _marker: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<M, N, F> Handler<M> for FilterMapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> Option<N> + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        match (self.transform)(message) {
            Some(translated) => self.inner.handle(translated, cancel).await,
            None => Ok(()),
        }
    }
}

/// Expands each message into several inner messages, delivered in order.
///
/// Delivery stops at the first failing expansion; already-delivered
/// expansions are not rolled back.
pub struct FlatMapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> Vec<N> + Send + Sync + 'static,
{
    inner: DynHandler<N>,
    transform: F,
    _marker: std::marker::PhantomData<fn(M)>,
}

impl<M, N, F> FlatMapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> Vec<N> + Send + Sync + 'static,
{
    pub(crate) fn stage(inner: DynHandler<N>, transform: F) -> DynHandler<M> {
        Arc::new(Self {
            inner,
            transform,
            _marker: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<M, N, F> Handler<M> for FlatMapBridge<M, N, F>
where
    M: Send + 'static,
    N: Send + 'static,
    F: Fn(M) -> Vec<N> + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        for translated in (self.transform)(message) {
            self.inner.handle(translated, cancel.clone()).await?;
        }
        Ok(())
    }
}
