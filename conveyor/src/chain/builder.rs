//! Chain builder: declares stages, compiles them into one handler.

use super::compiled::{Chain, DisposalGate};
use super::handle::ChainHandle;
use super::notifier::ChainServices;
use crate::cancellation::CancelToken;
use crate::errors::BuildError;
use crate::handler::{handler_fn, DispatchResult, DynHandler};
use crate::stages::branch::BranchStage;
use crate::stages::bounded::{FirstStage, SkipStage, SkipWhileStage, TakeStage, TakeWhileStage};
use crate::stages::concurrent::ConcurrentStage;
use crate::stages::detach::{BackgroundDetachStage, BoundedDetachStage, DetachStage};
use crate::stages::keyed::KeyedStage;
use crate::stages::reclaim::ReclamationSweeper;
use crate::stages::retry::{
    RetryFailureCallback, RetryPolicy, RetrySink, RetryStage, RetrySuccessCallback,
};
use crate::stages::throughput::{parse_period, ThroughputStage};
use crate::stages::transform::{FilterMapBridge, FilterStage, FlatMapBridge, MapBridge};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

type StageFactory<M> =
    Box<dyn FnOnce(DynHandler<M>, &ChainServices) -> Result<DynHandler<M>, BuildError> + Send>;
type TerminalFactory<M> =
    Box<dyn FnOnce(&ChainServices) -> Result<DynHandler<M>, BuildError> + Send>;

/// Configuration callback for one branch of a fan-out stage.
pub type BranchConfig<M> =
    Box<dyn FnOnce(ChainBuilder<M>) -> Result<ChainBuilder<M>, BuildError> + Send>;

/// Builder for a message-processing chain.
///
/// Mutable and single-use: it accumulates an ordered list of stage
/// factories plus exactly one terminal handler, then [`build`](Self::build)
/// consumes it and compiles the declared sequence into one callable
/// [`Chain`].
///
/// Stages compose right-to-left: the terminal handler is innermost, and the
/// first stage declared is the outermost wrapper a message meets. The order
/// is load-bearing — `retry` declared before `concurrent` re-enters the
/// concurrency gate on every attempt, while the reverse retries inside one
/// acquired slot.
pub struct ChainBuilder<M: Send + 'static> {
    name: String,
    stages: Vec<StageFactory<M>>,
    terminal: Option<TerminalFactory<M>>,
}

impl<M: Send + 'static> ChainBuilder<M> {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            terminal: None,
        }
    }

    /// Returns the chain name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of declared stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if a terminal handler has been set.
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.terminal.is_some()
    }

    /// Appends a wrapping stage factory.
    ///
    /// The factory receives the next handler in the chain and the
    /// compilation services, and returns the wrapping handler.
    #[must_use]
    pub fn add_stage<F>(self, factory: F) -> Self
    where
        F: FnOnce(DynHandler<M>, &ChainServices) -> DynHandler<M> + Send + 'static,
    {
        self.add_stage_factory(Box::new(move |next, services| Ok(factory(next, services))))
    }

    fn add_stage_factory(mut self, factory: StageFactory<M>) -> Self {
        self.stages.push(factory);
        self
    }

    /// Sets the terminal handler factory.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::HandlerAlreadySet`] if a terminal handler was
    /// already set.
    pub fn set_handler<F>(mut self, factory: F) -> Result<Self, BuildError>
    where
        F: FnOnce(&ChainServices) -> Result<DynHandler<M>, BuildError> + Send + 'static,
    {
        if self.terminal.is_some() {
            return Err(BuildError::HandlerAlreadySet);
        }
        self.terminal = Some(Box::new(factory));
        Ok(self)
    }

    /// Sets a pre-built handler as the terminal stage.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::HandlerAlreadySet`] if a terminal handler was
    /// already set.
    pub fn handle(self, handler: DynHandler<M>) -> Result<Self, BuildError> {
        self.set_handler(move |_services| Ok(handler))
    }

    /// Sets an async closure as the terminal stage.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::HandlerAlreadySet`] if a terminal handler was
    /// already set.
    pub fn handle_fn<F, Fut>(self, func: F) -> Result<Self, BuildError>
    where
        F: Fn(M, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult> + Send + 'static,
    {
        self.handle(handler_fn(func))
    }

    /// Sets a reclaimable (non-owning) reference to `target` as the
    /// terminal stage and registers it with `sweeper`.
    ///
    /// The chain does not keep `target` alive. Once the last strong
    /// reference elsewhere is dropped, the next delivery — or the sweeper,
    /// even with no traffic — disposes the chain.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::HandlerAlreadySet`] if a terminal handler was
    /// already set.
    pub fn handle_weak(
        self,
        target: &DynHandler<M>,
        sweeper: &Arc<ReclamationSweeper>,
    ) -> Result<Self, BuildError> {
        let weak = Arc::downgrade(target);
        let sweeper = sweeper.clone();
        self.set_handler(move |services| {
            Ok(crate::stages::reclaim::ReclaimableHandler::stage(
                weak, &sweeper, services,
            ))
        })
    }

    /// Compiles the declared stages and terminal handler into a chain.
    ///
    /// Compilation is synchronous: every stage registered with the
    /// lifecycle notifier receives the finished handle before this method
    /// returns, so no message can outrun the notification.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingHandler`] if no terminal handler was
    /// set, or the first configuration error raised by a stage factory.
    pub fn build(self) -> Result<Chain<M>, BuildError> {
        let terminal = self.terminal.ok_or(BuildError::MissingHandler)?;
        let stage_count = self.stages.len();

        let services = ChainServices::new();
        let mut handler = terminal(&services)?;
        for factory in self.stages.into_iter().rev() {
            handler = factory(handler, &services)?;
        }

        let handle = ChainHandle::new();
        let gated = DisposalGate::wrap(handler, handle.clone());

        tracing::debug!(
            chain = %self.name,
            chain_id = %handle.id(),
            stages = stage_count,
            "chain compiled"
        );

        services.notifier().notify(handle.clone());
        Ok(Chain::new(self.name, gated, handle))
    }

    // ---- concurrency-control stages ----

    /// Caps concurrent in-flight executions of the downstream chain.
    ///
    /// Publishers suspend while all slots are taken; this is the chain's
    /// backpressure point. Messages are neither dropped nor reordered on
    /// entry, though parallel handlers may complete out of order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_concurrent` is zero.
    pub fn concurrent(self, max_concurrent: usize) -> Result<Self, BuildError> {
        if max_concurrent == 0 {
            return Err(BuildError::invalid_config(
                "max_concurrent must be at least 1",
            ));
        }
        Ok(self.add_stage(move |next, _services| ConcurrentStage::stage(next, max_concurrent)))
    }

    /// Decouples publisher completion from handler completion, preserving
    /// synchronous-failure visibility.
    ///
    /// If the downstream handler completes without suspending, the
    /// publisher observes that completion, including immediate failures.
    /// Otherwise the remainder runs in the background and the publisher
    /// gets an immediate success.
    #[must_use]
    pub fn detach(self) -> Self {
        self.add_stage(|next, _services| DetachStage::stage(next))
    }

    /// Unconditionally runs the downstream handler in the background and
    /// returns success immediately. Background failures are suppressed by
    /// design.
    #[must_use]
    pub fn detach_background(self) -> Self {
        self.add_stage(|next, _services| BackgroundDetachStage::stage(next))
    }

    /// Background dispatch with a concurrency cap.
    ///
    /// Every message is handed to background execution immediately — the
    /// publisher never blocks — but at most `max_concurrent` handler
    /// bodies run at once; excess messages wait in the background for a
    /// free slot. Nothing is dropped.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_concurrent` is zero.
    pub fn detach_bounded(self, max_concurrent: usize) -> Result<Self, BuildError> {
        if max_concurrent == 0 {
            return Err(BuildError::invalid_config(
                "max_concurrent must be at least 1",
            ));
        }
        Ok(self.add_stage(move |next, _services| BoundedDetachStage::stage(next, max_concurrent)))
    }

    /// Caps throughput to `max_per_period` messages per `period`, queuing
    /// excess messages FIFO for later periods. Messages are never dropped.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_per_period` is zero or the
    /// period is zero.
    pub fn throughput(self, max_per_period: usize, period: Duration) -> Result<Self, BuildError> {
        if max_per_period == 0 {
            return Err(BuildError::invalid_config(
                "max_per_period must be at least 1",
            ));
        }
        if period.is_zero() {
            return Err(BuildError::invalid_config("period must be non-zero"));
        }
        Ok(self.add_stage(move |next, services| {
            ThroughputStage::stage(next, max_per_period, period, services)
        }))
    }

    /// Like [`throughput`](Self::throughput), with the period given as
    /// text ("250ms", "2s", "1m").
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the period text does not parse or
    /// `max_per_period` is zero.
    pub fn throughput_text(self, max_per_period: usize, period: &str) -> Result<Self, BuildError> {
        let period = parse_period(period)?;
        self.throughput(max_per_period, period)
    }

    /// Serializes messages sharing a derived key (single slot per key).
    ///
    /// Messages with different keys proceed fully in parallel.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with the other
    /// concurrency stages.
    pub fn keyed<K, F>(self, selector: F) -> Result<Self, BuildError>
    where
        K: Eq + Hash + Send + Sync + 'static,
        F: Fn(&M) -> K + Send + Sync + 'static,
    {
        self.keyed_with_limit(selector, 1)
    }

    /// Caps concurrency independently per derived key.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_per_key` is zero.
    pub fn keyed_with_limit<K, F>(self, selector: F, max_per_key: usize) -> Result<Self, BuildError>
    where
        K: Eq + Hash + Send + Sync + 'static,
        F: Fn(&M) -> K + Send + Sync + 'static,
    {
        if max_per_key == 0 {
            return Err(BuildError::invalid_config("max_per_key must be at least 1"));
        }
        Ok(self.add_stage(move |next, _services| KeyedStage::stage(next, selector, max_per_key)))
    }

    /// Retries failing downstream handlers per `policy`.
    ///
    /// Cancellation failures are never retried. Exhaustion raises an
    /// aggregate failure carrying every attempt's cause.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the policy is invalid.
    pub fn retry(self, policy: RetryPolicy) -> Result<Self, BuildError>
    where
        M: Clone,
    {
        policy.validate()?;
        Ok(self.add_stage(move |next, _services| RetryStage::stage(next, policy)))
    }

    /// Retry with per-failed-attempt and success callbacks.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the policy is invalid.
    pub fn retry_with_callbacks(
        self,
        policy: RetryPolicy,
        on_failure: Option<RetryFailureCallback>,
        on_success: Option<RetrySuccessCallback>,
    ) -> Result<Self, BuildError>
    where
        M: Clone,
    {
        policy.validate()?;
        Ok(self.add_stage(move |next, _services| {
            RetryStage::stage_with_callbacks(next, policy, on_failure, on_success)
        }))
    }

    /// Retry with a [`RetrySink`] substituted for the callback pair.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the policy is invalid.
    pub fn retry_with_sink(
        self,
        policy: RetryPolicy,
        sink: Arc<dyn RetrySink>,
    ) -> Result<Self, BuildError>
    where
        M: Clone,
    {
        policy.validate()?;
        Ok(self
            .add_stage(move |next, _services| RetryStage::stage_with_sink(next, policy, sink)))
    }

    // ---- count/predicate-bounded stages ----

    /// Admits the first `count` messages, then disposes the chain on the
    /// next delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `count` is zero.
    pub fn take(self, count: usize) -> Result<Self, BuildError> {
        let count = i64::try_from(count).ok().filter(|c| *c > 0).ok_or_else(|| {
            BuildError::invalid_config("take count must be between 1 and i64::MAX")
        })?;
        Ok(self.add_stage(move |next, services| TakeStage::stage(next, count, services)))
    }

    /// Admits messages while `predicate` holds; the first failing message
    /// is dropped and the chain disposed. The predicate is never
    /// re-evaluated after the flip.
    #[must_use]
    pub fn take_while<P>(self, predicate: P) -> Self
    where
        P: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.add_stage(move |next, services| TakeWhileStage::stage(next, predicate, services))
    }

    /// Drops the first `count` messages, admits the rest indefinitely.
    #[must_use]
    pub fn skip(self, count: usize) -> Self {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.add_stage(move |next, _services| SkipStage::stage(next, count))
    }

    /// Drops messages while `predicate` holds; once it first fails, admits
    /// all subsequent messages without re-evaluating.
    #[must_use]
    pub fn skip_while<P>(self, predicate: P) -> Self
    where
        P: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.add_stage(move |next, _services| SkipWhileStage::stage(next, predicate))
    }

    /// Delivers only the first message matching `predicate`, then disposes
    /// the chain.
    #[must_use]
    pub fn first<P>(self, predicate: P) -> Self
    where
        P: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.add_stage(move |next, services| FirstStage::stage(next, predicate, services))
    }

    /// Forwards only messages matching `predicate`; others are dropped
    /// without error.
    #[must_use]
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.add_stage(move |next, _services| FilterStage::stage(next, predicate))
    }

    // ---- fan-out stages ----

    /// Fans each message out to two or more independently built
    /// sub-chains, replacing the terminal handler.
    ///
    /// All branches receive every message concurrently; completion is the
    /// join of all branch completions. A branch that self-disposes is
    /// removed from the set; when the set empties, the owning chain is
    /// disposed.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::HandlerAlreadySet`] if a terminal handler was
    /// already set, a configuration error if fewer than two branches are
    /// given, or the first error raised while building a branch.
    pub fn branch(self, configs: Vec<BranchConfig<M>>) -> Result<Self, BuildError>
    where
        M: Clone,
    {
        if configs.len() < 2 {
            return Err(BuildError::invalid_config(
                "branch requires at least two branches",
            ));
        }
        let name = self.name.clone();
        self.set_handler(move |services| {
            let chains = build_branches(&name, configs)?;
            Ok(BranchStage::stage(None, chains, services))
        })
    }

    /// Fans each message out to sub-chains running alongside the main
    /// downstream handler.
    ///
    /// The main handler is one more branch, always present; it is not
    /// individually disposable, so exhaustion of the configured branches
    /// degrades this stage to a pass-through rather than disposing the
    /// chain.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no branches are given, or the
    /// first error raised while building a branch.
    pub fn branch_out(self, configs: Vec<BranchConfig<M>>) -> Result<Self, BuildError>
    where
        M: Clone,
    {
        if configs.is_empty() {
            return Err(BuildError::invalid_config(
                "branch_out requires at least one branch",
            ));
        }
        let name = self.name.clone();
        Ok(self.add_stage_factory(Box::new(move |next, services| {
            let chains = build_branches(&name, configs)?;
            Ok(BranchStage::stage(Some(next), chains, services))
        })))
    }

    // ---- derived-type bridges ----

    /// Maps each message to a new type and forwards it into an inner chain
    /// configured by `configure`, replacing the terminal handler.
    ///
    /// The inner chain is compiled during the outer compile; disposal
    /// cascades in both directions between the two chains.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::HandlerAlreadySet`] if a terminal handler was
    /// already set, or any error raised while building the inner chain.
    pub fn map<N, F, C>(self, transform: F, configure: C) -> Result<Self, BuildError>
    where
        N: Send + 'static,
        F: Fn(M) -> N + Send + Sync + 'static,
        C: FnOnce(ChainBuilder<N>) -> Result<ChainBuilder<N>, BuildError> + Send + 'static,
    {
        let name = format!("{}-map", self.name);
        self.set_handler(move |services| {
            let inner = configure(ChainBuilder::new(name))?.build()?;
            link_disposal(services, inner.handle().clone());
            Ok(MapBridge::stage(inner.into_handler(), transform))
        })
    }

    /// Filter-and-cast bridge: messages for which `transform` returns
    /// `None` are dropped; the rest forward into the inner chain.
    ///
    /// # Errors
    ///
    /// Same conditions as [`map`](Self::map).
    pub fn filter_map<N, F, C>(self, transform: F, configure: C) -> Result<Self, BuildError>
    where
        N: Send + 'static,
        F: Fn(M) -> Option<N> + Send + Sync + 'static,
        C: FnOnce(ChainBuilder<N>) -> Result<ChainBuilder<N>, BuildError> + Send + 'static,
    {
        let name = format!("{}-filter-map", self.name);
        self.set_handler(move |services| {
            let inner = configure(ChainBuilder::new(name))?.build()?;
            link_disposal(services, inner.handle().clone());
            Ok(FilterMapBridge::stage(inner.into_handler(), transform))
        })
    }

    /// Flat-map bridge: each message expands into several inner messages,
    /// delivered to the inner chain in order. Delivery stops at the first
    /// failing expansion.
    ///
    /// # Errors
    ///
    /// Same conditions as [`map`](Self::map).
    pub fn flat_map<N, F, C>(self, transform: F, configure: C) -> Result<Self, BuildError>
    where
        N: Send + 'static,
        F: Fn(M) -> Vec<N> + Send + Sync + 'static,
        C: FnOnce(ChainBuilder<N>) -> Result<ChainBuilder<N>, BuildError> + Send + 'static,
    {
        let name = format!("{}-flat-map", self.name);
        self.set_handler(move |services| {
            let inner = configure(ChainBuilder::new(name))?.build()?;
            link_disposal(services, inner.handle().clone());
            Ok(FlatMapBridge::stage(inner.into_handler(), transform))
        })
    }
}

impl<M: Send + 'static> std::fmt::Debug for ChainBuilder<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

fn build_branches<M: Send + 'static>(
    name: &str,
    configs: Vec<BranchConfig<M>>,
) -> Result<Vec<Chain<M>>, BuildError> {
    let mut chains = Vec::with_capacity(configs.len());
    for (index, config) in configs.into_iter().enumerate() {
        let builder = ChainBuilder::new(format!("{name}-branch-{index}"));
        chains.push(config(builder)?.build()?);
    }
    Ok(chains)
}

/// Cross-links disposal between the enclosing chain (once its handle
/// exists) and an inner chain compiled during the same build. Idempotent
/// disposal keeps the cross-link from recursing.
fn link_disposal(services: &ChainServices, inner: ChainHandle) {
    services.notifier().register(move |outer| {
        let inner_for_outer = inner.clone();
        outer.on_dispose(move || inner_for_outer.dispose());
        let outer_for_inner = outer;
        inner.on_dispose(move || outer_for_inner.dispose());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DispatchError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> DynHandler<u32> {
        handler_fn(move |_message: u32, _cancel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_build_without_handler_errors() {
        let result = ChainBuilder::<u32>::new("test").build();
        assert_eq!(result.unwrap_err(), BuildError::MissingHandler);
    }

    #[test]
    fn test_second_handler_errors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = ChainBuilder::new("test")
            .handle(counting_handler(counter.clone()))
            .unwrap()
            .handle(counting_handler(counter));
        assert_eq!(result.unwrap_err(), BuildError::HandlerAlreadySet);
    }

    #[test]
    fn test_zero_concurrency_errors() {
        let result = ChainBuilder::<u32>::new("test").concurrent(0);
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_take_errors() {
        let result = ChainBuilder::<u32>::new("test").take(0);
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_branch_requires_two_branches() {
        let result = ChainBuilder::<u32>::new("test")
            .branch(vec![Box::new(|b: ChainBuilder<u32>| Ok(b))]);
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_branch_build_error_surfaces_at_compile() {
        // A branch with no terminal handler is a usage error caught by the
        // outer build, not at dispatch time.
        let result = ChainBuilder::<u32>::new("test")
            .branch(vec![
                Box::new(|b: ChainBuilder<u32>| Ok(b)),
                Box::new(|b: ChainBuilder<u32>| Ok(b)),
            ])
            .unwrap()
            .build();
        assert_eq!(result.unwrap_err(), BuildError::MissingHandler);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_terminal_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = ChainBuilder::new("test")
            .handle(counting_handler(counter.clone()))
            .unwrap()
            .build()
            .unwrap();

        chain.dispatch(1, CancelToken::new()).await.unwrap();
        chain.dispatch(2, CancelToken::new()).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(chain.name(), "test");
    }

    #[tokio::test]
    async fn test_disposed_chain_drops_messages() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = ChainBuilder::new("test")
            .handle(counting_handler(counter.clone()))
            .unwrap()
            .build()
            .unwrap();

        chain.dispatch(1, CancelToken::new()).await.unwrap();
        chain.dispose();
        chain.dispatch(2, CancelToken::new()).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(chain.handle().is_disposed());
    }

    #[tokio::test]
    async fn test_stage_declaration_order_is_wrapping_order() {
        let visits = Arc::new(parking_lot::Mutex::new(Vec::new()));

        fn recording_stage(
            label: &'static str,
            visits: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        ) -> impl FnOnce(DynHandler<u32>, &ChainServices) -> DynHandler<u32> {
            move |next, _services| {
                handler_fn(move |message: u32, cancel| {
                    let next = next.clone();
                    let visits = visits.clone();
                    async move {
                        visits.lock().push(label);
                        next.handle(message, cancel).await
                    }
                })
            }
        }

        let visits_handler = visits.clone();
        let chain = ChainBuilder::new("ordered")
            .add_stage(recording_stage("a", visits.clone()))
            .add_stage(recording_stage("b", visits.clone()))
            .handle_fn(move |_message: u32, _cancel| {
                let visits = visits_handler.clone();
                async move {
                    visits.lock().push("handler");
                    Ok(())
                }
            })
            .unwrap()
            .build()
            .unwrap();

        chain.dispatch(1, CancelToken::new()).await.unwrap();
        assert_eq!(*visits.lock(), vec!["a", "b", "handler"]);
    }

    #[tokio::test]
    async fn test_handler_failure_propagates_to_publisher() {
        let chain = ChainBuilder::new("failing")
            .handle_fn(|_message: u32, _cancel| async {
                Err(DispatchError::handler("rejected"))
            })
            .unwrap()
            .build()
            .unwrap();

        let err = chain.dispatch(1, CancelToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "handler failure: rejected");
    }

    #[tokio::test]
    async fn test_map_bridge_translates_and_forwards() {
        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let collected_clone = collected.clone();

        let chain = ChainBuilder::new("bridge")
            .map(
                |message: u32| format!("msg-{message}"),
                move |inner| {
                    inner.handle_fn(move |message: String, _cancel| {
                        let collected = collected_clone.clone();
                        async move {
                            collected.lock().push(message);
                            Ok(())
                        }
                    })
                },
            )
            .unwrap()
            .build()
            .unwrap();

        chain.dispatch(3, CancelToken::new()).await.unwrap();
        assert_eq!(*collected.lock(), vec!["msg-3".to_string()]);
    }

    #[tokio::test]
    async fn test_bridge_inner_disposal_cascades_to_outer() {
        let collected = Arc::new(AtomicUsize::new(0));
        let collected_clone = collected.clone();

        // The inner chain takes one message, then disposes itself; the
        // cascade must dispose the outer chain too.
        let chain = ChainBuilder::new("bridge")
            .map(
                |message: u32| u64::from(message),
                move |inner| {
                    inner.take(1)?.handle_fn(move |_message: u64, _cancel| {
                        let collected = collected_clone.clone();
                        async move {
                            collected.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                },
            )
            .unwrap()
            .build()
            .unwrap();

        chain.dispatch(1, CancelToken::new()).await.unwrap();
        chain.dispatch(2, CancelToken::new()).await.unwrap();
        chain.dispatch(3, CancelToken::new()).await.unwrap();

        assert_eq!(collected.load(Ordering::SeqCst), 1);
        assert!(chain.handle().is_disposed());
    }

    #[tokio::test]
    async fn test_filter_map_drops_unmatched() {
        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let collected_clone = collected.clone();

        let chain = ChainBuilder::new("filter-map")
            .filter_map(
                |message: u32| (message % 2 == 0).then_some(message * 10),
                move |inner| {
                    inner.handle_fn(move |message: u32, _cancel| {
                        let collected = collected_clone.clone();
                        async move {
                            collected.lock().push(message);
                            Ok(())
                        }
                    })
                },
            )
            .unwrap()
            .build()
            .unwrap();

        for message in 1..=4 {
            chain.dispatch(message, CancelToken::new()).await.unwrap();
        }
        assert_eq!(*collected.lock(), vec![20, 40]);
    }

    #[tokio::test]
    async fn test_flat_map_expands_in_order() {
        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let collected_clone = collected.clone();

        let chain = ChainBuilder::new("flat-map")
            .flat_map(
                |message: u32| vec![message, message + 100],
                move |inner| {
                    inner.handle_fn(move |message: u32, _cancel| {
                        let collected = collected_clone.clone();
                        async move {
                            collected.lock().push(message);
                            Ok(())
                        }
                    })
                },
            )
            .unwrap()
            .build()
            .unwrap();

        chain.dispatch(1, CancelToken::new()).await.unwrap();
        chain.dispatch(2, CancelToken::new()).await.unwrap();
        assert_eq!(*collected.lock(), vec![1, 101, 2, 102]);
    }
}
