//! Fan-out stages: one message dispatched to several sub-chains.

use crate::cancellation::CancelToken;
use crate::chain::{Chain, ChainServices, HandleSlot};
use crate::errors::{BranchJoinError, DispatchError};
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

struct BranchEntry<M: Send + 'static> {
    id: Uuid,
    handler: DynHandler<M>,
}

impl<M: Send + 'static> Clone for BranchEntry<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: self.handler.clone(),
        }
    }
}

/// Dispatches each message to every live branch concurrently.
///
/// Completion is the join of all branch completions: every branch must
/// finish, and a failure in one neither cancels nor contaminates its
/// siblings — failing branches aggregate into a [`BranchJoinError`].
///
/// A branch that disposes itself (a `take`-style stage inside it, say) is
/// removed from the set; the set is a copy-on-write snapshot replaced
/// under a lock so concurrent dispatch and removal never race. With no
/// main handler ("pure" fan-out), an emptied set cascades disposal to the
/// owning chain; with a main handler the stage degrades to a pass-through
/// instead, because the main branch is always present.
pub struct BranchStage<M: Clone + Send + 'static> {
    main: Option<DynHandler<M>>,
    branches: Arc<RwLock<Arc<Vec<BranchEntry<M>>>>>,
    owner: HandleSlot,
}

impl<M: Clone + Send + 'static> BranchStage<M> {
    pub(crate) fn stage(
        main: Option<DynHandler<M>>,
        chains: Vec<Chain<M>>,
        services: &ChainServices,
    ) -> DynHandler<M> {
        let owner = HandleSlot::new();
        owner.attach(services);

        let branches: Arc<RwLock<Arc<Vec<BranchEntry<M>>>>> =
            Arc::new(RwLock::new(Arc::new(Vec::new())));
        let cascade_on_empty = main.is_none();

        let mut entries = Vec::with_capacity(chains.len());
        let mut handles = Vec::with_capacity(chains.len());
        for chain in chains {
            let id = Uuid::new_v4();
            let handle = chain.handle().clone();
            entries.push(BranchEntry {
                id,
                handler: chain.into_handler(),
            });

            let branches_for_removal = branches.clone();
            let owner_for_removal = owner.clone();
            handle.on_dispose(move || {
                let emptied = {
                    let mut set = branches_for_removal.write();
                    let remaining: Vec<_> =
                        set.iter().filter(|entry| entry.id != id).cloned().collect();
                    let emptied = remaining.is_empty();
                    *set = Arc::new(remaining);
                    emptied
                };
                if emptied && cascade_on_empty {
                    owner_for_removal.dispose();
                }
            });
            handles.push(handle);
        }
        *branches.write() = Arc::new(entries);

        // Owner teardown cascades to every branch still in the set.
        services.notifier().register(move |owner_handle| {
            owner_handle.on_dispose(move || {
                for handle in &handles {
                    handle.dispose();
                }
            });
        });

        Arc::new(Self {
            main,
            branches,
            owner,
        })
    }

    /// Returns the number of live branches (excluding the main handler).
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.branches.read().len()
    }
}

#[async_trait]
impl<M: Clone + Send + 'static> Handler<M> for BranchStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let snapshot = self.branches.read().clone();

        let mut dispatches = Vec::with_capacity(snapshot.len() + 1);
        if let Some(main) = &self.main {
            dispatches.push(main.handle(message.clone(), cancel.clone()));
        }
        for entry in snapshot.iter() {
            dispatches.push(entry.handler.handle(message.clone(), cancel.clone()));
        }

        let failures: Vec<DispatchError> = join_all(dispatches)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BranchJoinError { failures }.into())
        }
    }
}
