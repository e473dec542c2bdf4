//! Bounded-parallelism stage.

use crate::cancellation::CancelToken;
use crate::errors::DispatchError;
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Caps concurrent in-flight executions of the inner handler.
///
/// Publishers suspend while all slots are taken; the slot is released
/// unconditionally when the inner completion fires, success or failure.
/// One slot's failure does not affect the others.
pub struct ConcurrentStage<M: Send + 'static> {
    next: DynHandler<M>,
    permits: Arc<Semaphore>,
}

impl<M: Send + 'static> ConcurrentStage<M> {
    /// Wraps `next` with a `max_concurrent`-slot gate.
    pub(crate) fn stage(next: DynHandler<M>, max_concurrent: usize) -> DynHandler<M> {
        Arc::new(Self {
            next,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        })
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for ConcurrentStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DispatchError::handler("concurrency gate closed"))?;
        self.next.handle(message, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        completed: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }

        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gauged_handler(gauge: Arc<Gauge>, delay: Duration) -> DynHandler<u32> {
        handler_fn(move |_message: u32, _cancel| {
            let gauge = gauge.clone();
            async move {
                gauge.enter();
                tokio::time::sleep(delay).await;
                gauge.exit();
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_k_in_flight() {
        let gauge = Gauge::new();
        let stage = ConcurrentStage::stage(
            gauged_handler(gauge.clone(), Duration::from_millis(50)),
            2,
        );

        let mut tasks = Vec::new();
        for message in 0..5 {
            let stage = stage.clone();
            tasks.push(tokio::spawn(async move {
                stage.handle(message, CancelToken::new()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.completed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_message_starts_only_after_release() {
        let gauge = Gauge::new();
        let stage = ConcurrentStage::stage(
            gauged_handler(gauge.clone(), Duration::from_millis(50)),
            2,
        );

        for message in 0..3 {
            let stage = stage.clone();
            tokio::spawn(async move { stage.handle(message, CancelToken::new()).await });
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.completed.load(Ordering::SeqCst), 0);

        // The third message only enters once one of the first two finishes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gauge.completed.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gauge.completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_releases_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let stage = ConcurrentStage::stage(
            handler_fn(move |message: u32, _cancel| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if message == 0 {
                        Err(DispatchError::handler("boom"))
                    } else {
                        Ok(())
                    }
                }
            }),
            1,
        );

        assert!(stage.handle(0, CancelToken::new()).await.is_err());
        // The failed execution released its slot; the next message runs.
        assert!(stage.handle(1, CancelToken::new()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
