//! Rate-limiting stage: at most N messages admitted per period.

use crate::cancellation::CancelToken;
use crate::chain::ChainServices;
use crate::errors::BuildError;
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Parses a human-readable period ("250ms", "2s", "1m").
///
/// # Errors
///
/// Returns a configuration error for unparsable text or a zero period.
pub fn parse_period(text: &str) -> Result<Duration, BuildError> {
    let text = text.trim();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (value, unit) = text.split_at(digits_end);

    let value: u64 = value
        .parse()
        .map_err(|_| BuildError::invalid_config(format!("unparsable period '{text}'")))?;
    let period = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        _ => {
            return Err(BuildError::invalid_config(format!(
                "unparsable period '{text}' (expected ms, s, or m suffix)"
            )))
        }
    };

    if period.is_zero() {
        return Err(BuildError::invalid_config("period must be non-zero"));
    }
    Ok(period)
}

struct ThroughputState {
    admitted: usize,
    queue: VecDeque<oneshot::Sender<()>>,
}

/// Caps throughput to `max_per_period` messages per `period`.
///
/// Messages over the cap queue FIFO and are admitted by a periodic ticker,
/// up to `max_per_period` per tick; the remainder stays queued for later
/// ticks. Nothing is dropped — the only bound is memory for the queue.
///
/// The ticker task starts lazily on the first dispatch and stops when the
/// chain is disposed (queued messages are then dropped per the disposal
/// contract) or when the stage itself is dropped.
pub struct ThroughputStage<M: Send + 'static> {
    next: DynHandler<M>,
    max_per_period: usize,
    period: Duration,
    state: Arc<Mutex<ThroughputState>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<M: Send + 'static> ThroughputStage<M> {
    pub(crate) fn stage(
        next: DynHandler<M>,
        max_per_period: usize,
        period: Duration,
        services: &ChainServices,
    ) -> DynHandler<M> {
        let stage = Arc::new(Self {
            next,
            max_per_period,
            period,
            state: Arc::new(Mutex::new(ThroughputState {
                admitted: 0,
                queue: VecDeque::new(),
            })),
            ticker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let for_disposal = stage.clone();
        services.notifier().register(move |handle| {
            handle.on_dispose(move || for_disposal.stop());
        });

        stage
    }

    fn ensure_ticker(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = self.ticker.lock();
        if guard.is_some() {
            return;
        }

        let state = self.state.clone();
        let max_per_period = self.max_per_period;
        let period = self.period;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut state = state.lock();
                state.admitted = 0;
                while state.admitted < max_per_period {
                    let Some(sender) = state.queue.pop_front() else {
                        break;
                    };
                    // A dropped receiver means the waiter went away
                    // (cancelled); its slot goes to the next in line.
                    if sender.send(()).is_ok() {
                        state.admitted += 1;
                    }
                }
            }
        }));
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        // Dropping the senders wakes every queued waiter.
        self.state.lock().queue.clear();
    }
}

impl<M: Send + 'static> Drop for ThroughputStage<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl<M: Send + 'static> Handler<M> for ThroughputStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        self.ensure_ticker();

        let waiter = {
            let mut state = self.state.lock();
            if state.admitted < self.max_per_period {
                state.admitted += 1;
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                state.queue.push_back(sender);
                Some(receiver)
            }
        };

        if let Some(receiver) = waiter {
            tokio::select! {
                () = cancel.cancelled() => return Err(cancel.to_error()),
                admitted = receiver => {
                    if admitted.is_err() {
                        // Queue cleared on disposal: drop the message.
                        return Ok(());
                    }
                }
            }
        }

        self.next.handle(message, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_period("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_period("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_period(" 5s ").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_period_rejects_garbage() {
        assert!(parse_period("fast").is_err());
        assert!(parse_period("10").is_err());
        assert!(parse_period("10h").is_err());
        assert!(parse_period("").is_err());
        assert!(parse_period("0s").is_err());
    }

    fn counting_stage(
        max_per_period: usize,
        period: Duration,
        counter: Arc<AtomicUsize>,
    ) -> DynHandler<u32> {
        let services = ChainServices::new();
        ThroughputStage::stage(
            handler_fn(move |_message: u32, _cancel| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            max_per_period,
            period,
            &services,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_worked_example_70_messages_at_10_per_second() {
        let processed = Arc::new(AtomicUsize::new(0));
        let stage = counting_stage(10, Duration::from_secs(1), processed.clone());

        let mut tasks = Vec::new();
        for message in 0..70_u32 {
            let stage = stage.clone();
            tasks.push(tokio::spawn(async move {
                stage.handle(message, CancelToken::new()).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 10);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 20);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 60);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 70);

        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let services = ChainServices::new();
        let stage = {
            let order = order.clone();
            ThroughputStage::stage(
                handler_fn(move |message: u32, _cancel| {
                    let order = order.clone();
                    async move {
                        order.lock().push(message);
                        Ok(())
                    }
                }),
                1,
                Duration::from_millis(100),
                &services,
            )
        };

        let mut tasks = Vec::new();
        for message in 0..4_u32 {
            let stage = stage.clone();
            tasks.push(tokio::spawn(async move {
                stage.handle(message, CancelToken::new()).await
            }));
            // Deterministic arrival order for the queue.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_consume_slot() {
        let processed = Arc::new(AtomicUsize::new(0));
        let stage = counting_stage(1, Duration::from_secs(1), processed.clone());

        // Fill the period.
        stage.handle(0, CancelToken::new()).await.unwrap();

        // Queue one waiter, then cancel it.
        let cancel = CancelToken::new();
        let waiting = {
            let stage = stage.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { stage.handle(1, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel("caller gave up");
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // Queue a live waiter; the next tick admits it even though the
        // cancelled one was ahead in line.
        let live = {
            let stage = stage.clone();
            tokio::spawn(async move { stage.handle(2, CancelToken::new()).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        live.await.unwrap().unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposal_stops_ticker_and_drops_queued() {
        let processed = Arc::new(AtomicUsize::new(0));
        let services = ChainServices::new();
        let stage = {
            let processed = processed.clone();
            ThroughputStage::stage(
                handler_fn(move |_message: u32, _cancel| {
                    let processed = processed.clone();
                    async move {
                        processed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                1,
                Duration::from_secs(1),
                &services,
            )
        };
        let handle = crate::chain::ChainHandle::new();
        services.notifier().notify(handle.clone());

        stage.handle(0, CancelToken::new()).await.unwrap();
        let queued = {
            let stage = stage.clone();
            tokio::spawn(async move { stage.handle(1, CancelToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.dispose();

        // The queued message is dropped without error, and no tick ever
        // admits it.
        queued.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 1);
    }
}
