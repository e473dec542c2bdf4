//! Chain composition: builder, compiled chain, handle, lifecycle notifier.
//!
//! This module provides:
//! - The single-use [`ChainBuilder`] and its fluent stage surface
//! - The compiled [`Chain`] with its disposable [`ChainHandle`]
//! - The [`LifecycleNotifier`] bridging stage construction and handle
//!   availability

mod builder;
mod compiled;
mod handle;
mod notifier;

pub use builder::{BranchConfig, ChainBuilder};
pub use compiled::Chain;
pub use handle::ChainHandle;
pub use notifier::{ChainServices, HandleSlot, LifecycleNotifier};
