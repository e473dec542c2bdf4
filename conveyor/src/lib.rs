//! # Conveyor
//!
//! Composable middleware pipelines for asynchronous message delivery.
//!
//! A caller publishes a message; a chain of independently-authored stages
//! transforms, filters, throttles, and retries it before handing it to a
//! terminal handler. Conveyor provides:
//!
//! - **Chain composition**: a single-use builder compiles declared stages
//!   into one callable pipeline with a disposable handle
//! - **Self-disposal**: a stage buried inside the chain can tear the whole
//!   pipeline down from the inside
//! - **Concurrency control**: bounded parallelism, rate limiting, per-key
//!   mutual exclusion, and retry with backoff
//! - **Fan-out**: independently built sub-chains per message with
//!   cascading teardown
//! - **Reclaimable references**: chain lifetime tied to the external
//!   reachability of its handler, with a background sweeper
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conveyor::prelude::*;
//!
//! // Declare a chain: order is wrapping order.
//! let chain = ChainBuilder::new("orders")
//!     .retry(RetryPolicy::new().with_max_attempts(3))?
//!     .concurrent(8)?
//!     .handle_fn(|order: Order, _cancel| async move {
//!         process(order).await
//!     })?
//!     .build()?;
//!
//! // Publish a message.
//! chain.dispatch(order, CancelToken::new()).await?;
//! ```
//!
//! Everything is strictly in-process: no persistence, no delivery
//! guarantees across restarts, no distributed transport.

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod chain;
pub mod errors;
pub mod handler;
pub mod stages;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancelToken;
    pub use crate::chain::{
        BranchConfig, Chain, ChainBuilder, ChainHandle, ChainServices, HandleSlot,
        LifecycleNotifier,
    };
    pub use crate::errors::{BranchJoinError, BuildError, DispatchError, RetryExhaustedError};
    pub use crate::handler::{handler_fn, DispatchResult, DynHandler, Handler};
    pub use crate::stages::{
        parse_period, Backoff, Jitter, ReclamationSweeper, RetryPolicy, RetrySink,
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn library_compiles() {
        assert!(true);
    }
}
