//! Decorator stages composed by the chain builder.
//!
//! Each stage wraps the next handler and adds one behavior:
//! - Concurrency control: bounded parallelism, rate limiting, keyed
//!   mutual exclusion, retry with backoff
//! - Decoupled dispatch: soft, hard, and bounded fire-and-forget
//! - Fan-out: independently built sub-chains per message
//! - Admission bounds: take, take-while, skip, skip-while, first
//! - Reclaimable references with a background sweeper
//!
//! Stages never log; where a stage intentionally drops a message or a
//! failure, the drop is part of that stage's documented contract.

pub mod bounded;
pub mod branch;
pub mod concurrent;
pub mod detach;
pub mod keyed;
pub mod reclaim;
pub mod retry;
pub mod throughput;
pub mod transform;

pub use bounded::{FirstStage, SkipStage, SkipWhileStage, TakeStage, TakeWhileStage};
pub use branch::BranchStage;
pub use concurrent::ConcurrentStage;
pub use detach::{BackgroundDetachStage, BoundedDetachStage, DetachStage};
pub use keyed::KeyedStage;
pub use reclaim::{ReclaimableHandler, ReclamationSweeper};
pub use retry::{
    Backoff, Jitter, RetryFailureCallback, RetryPolicy, RetrySink, RetryStage,
    RetrySuccessCallback,
};
pub use throughput::{parse_period, ThroughputStage};
pub use transform::{FilterMapBridge, FilterStage, FlatMapBridge, MapBridge};
