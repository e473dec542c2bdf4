//! Keyed mutual-exclusion stage.

use crate::cancellation::CancelToken;
use crate::errors::DispatchError;
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Caps concurrency independently per derived key.
///
/// Each key gets its own counting semaphore, created lazily on first use
/// and never evicted: the table grows with the number of distinct keys the
/// selector produces over the chain's lifetime. Messages with different
/// keys proceed fully in parallel, independently of any global concurrency
/// cap elsewhere in the chain.
pub struct KeyedStage<M, K, F>
where
    M: Send + 'static,
    K: Eq + Hash + Send + Sync + 'static,
    F: Fn(&M) -> K + Send + Sync + 'static,
{
    next: DynHandler<M>,
    selector: F,
    max_per_key: usize,
    table: DashMap<K, Arc<Semaphore>>,
}

impl<M, K, F> KeyedStage<M, K, F>
where
    M: Send + 'static,
    K: Eq + Hash + Send + Sync + 'static,
    F: Fn(&M) -> K + Send + Sync + 'static,
{
    pub(crate) fn stage(next: DynHandler<M>, selector: F, max_per_key: usize) -> DynHandler<M> {
        Arc::new(Self {
            next,
            selector,
            max_per_key,
            table: DashMap::new(),
        })
    }

    /// Returns the number of distinct keys seen so far.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl<M, K, F> Handler<M> for KeyedStage<M, K, F>
where
    M: Send + 'static,
    K: Eq + Hash + Send + Sync + 'static,
    F: Fn(&M) -> K + Send + Sync + 'static,
{
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let key = (self.selector)(&message);
        let semaphore = {
            let entry = self
                .table
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_key)));
            entry.value().clone()
        };

        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::handler("keyed gate closed"))?;
        self.next.handle(message, cancel).await
    }
}
