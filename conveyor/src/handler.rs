//! The handler contract shared by every stage.
//!
//! A handler is a function from `(message, cancellation token)` to a
//! completion. The terminal handler is application code; every decorator
//! stage is itself a handler wrapping the next one.

use crate::cancellation::CancelToken;
use crate::errors::DispatchError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Completion of a single handler invocation.
pub type DispatchResult = Result<(), DispatchError>;

/// Trait for message handlers.
///
/// Implement this directly for typed handlers, or use [`handler_fn`] to
/// adapt a closure.
#[async_trait]
pub trait Handler<M: Send + 'static>: Send + Sync {
    /// Handles one message.
    ///
    /// The cancellation token must be propagated unchanged to any inner
    /// handler the implementation wraps.
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult;
}

/// A shared, dynamically dispatched handler.
pub type DynHandler<M> = Arc<dyn Handler<M>>;

/// A function-based handler.
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<M, F, Fut> Handler<M> for FnHandler<F>
where
    M: Send + 'static,
    F: Fn(M, CancelToken) -> Fut + Send + Sync,
    Fut: Future<Output = DispatchResult> + Send,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        (self.func)(message, cancel).await
    }
}

/// Adapts an async closure into a [`DynHandler`].
pub fn handler_fn<M, F, Fut>(func: F) -> DynHandler<M>
where
    M: Send + 'static,
    F: Fn(M, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    Arc::new(FnHandler { func })
}
