//! The compiled chain: one composed handler plus its disposable handle.

use super::handle::ChainHandle;
use crate::cancellation::CancelToken;
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// A compiled pipeline.
///
/// Produced once by [`ChainBuilder::build`](crate::chain::ChainBuilder::build);
/// lives for the duration of the owning subscription. Torn down either
/// externally through [`Chain::dispose`] or internally by a self-disposing
/// stage.
pub struct Chain<M: Send + 'static> {
    name: String,
    handler: DynHandler<M>,
    handle: ChainHandle,
}

impl<M: Send + 'static> Chain<M> {
    pub(crate) fn new(name: String, handler: DynHandler<M>, handle: ChainHandle) -> Self {
        Self {
            name,
            handler,
            handle,
        }
    }

    /// Dispatches one message through the chain.
    ///
    /// This is the only entry point for publish callers. After disposal
    /// the message is dropped without reaching the terminal handler.
    pub async fn dispatch(&self, message: M, cancel: CancelToken) -> DispatchResult {
        self.handler.handle(message, cancel).await
    }

    /// Returns the chain's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the chain's unique id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.handle.id()
    }

    /// Returns the disposable handle.
    #[must_use]
    pub fn handle(&self) -> &ChainHandle {
        &self.handle
    }

    /// Disposes the chain. Equivalent to `self.handle().dispose()`.
    pub fn dispose(&self) {
        self.handle.dispose();
    }

    /// Returns a shared reference to the composed handler.
    ///
    /// The returned handler still honors disposal: messages dispatched
    /// through it after `dispose` are dropped.
    #[must_use]
    pub fn handler(&self) -> DynHandler<M> {
        self.handler.clone()
    }

    /// Consumes the chain, returning the composed handler for embedding
    /// into an enclosing pipeline.
    #[must_use]
    pub fn into_handler(self) -> DynHandler<M> {
        self.handler
    }
}

impl<M: Send + 'static> std::fmt::Debug for Chain<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Outermost wrapper inserted by compilation.
///
/// Drops messages received after disposal instead of forwarding them; the
/// drop is silent (`Ok(())`) per the handle contract, not a failure.
pub(crate) struct DisposalGate<M: Send + 'static> {
    inner: DynHandler<M>,
    handle: ChainHandle,
}

impl<M: Send + 'static> DisposalGate<M> {
    pub(crate) fn wrap(inner: DynHandler<M>, handle: ChainHandle) -> DynHandler<M> {
        Arc::new(Self { inner, handle })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for DisposalGate<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        if self.handle.is_disposed() {
            tracing::trace!(chain_id = %self.handle.id(), "message dropped after disposal");
            return Ok(());
        }
        self.inner.handle(message, cancel).await
    }
}
