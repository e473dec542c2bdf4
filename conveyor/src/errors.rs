//! Error types for the conveyor framework.
//!
//! Two families: [`BuildError`] covers usage mistakes caught while a chain
//! is being configured or compiled, and [`DispatchError`] covers failures
//! raised while a message flows through a compiled chain.

use thiserror::Error;

/// Error raised while configuring or compiling a chain.
///
/// These always surface at build time, never while messages are flowing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// `build` was called on a builder with no terminal handler.
    #[error("chain has no handler")]
    MissingHandler,

    /// A terminal handler was set on a builder that already has one.
    #[error("chain already has a handler")]
    HandlerAlreadySet,

    /// A stage was configured with an invalid value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BuildError {
    /// Creates an invalid-configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Error raised while a message flows through a compiled chain.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The application handler (or a stage acting on its behalf) failed.
    #[error("handler failure: {0}")]
    Handler(String),

    /// Dispatch was cancelled via the cancellation token.
    ///
    /// Cancellation is a distinct, non-retryable signal: stages that retry
    /// or suppress other failures let this one pass through unchanged.
    #[error("dispatch cancelled: {0}")]
    Cancelled(String),

    /// A retry stage exhausted its attempts.
    #[error(transparent)]
    RetryExhausted(#[from] RetryExhaustedError),

    /// One or more branches of a fan-out dispatch failed.
    #[error(transparent)]
    BranchJoin(#[from] BranchJoinError),
}

impl DispatchError {
    /// Creates a handler failure with the given message.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Creates a cancellation failure with the given reason.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Returns true if this failure was triggered by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Aggregate failure raised when a retry stage runs out of attempts.
///
/// Carries the cause of every attempt in order, never just the last one.
#[derive(Debug, Clone, Error)]
#[error("retry exhausted after {attempts} attempts (base delay {delay_ms}ms)")]
pub struct RetryExhaustedError {
    /// One causative failure per attempt, in attempt order.
    pub causes: Vec<DispatchError>,
    /// The number of attempts made.
    pub attempts: usize,
    /// The configured base delay between attempts, in milliseconds.
    pub delay_ms: u64,
}

/// Aggregate failure raised when one or more branches of a fan-out fail.
///
/// Only the failing branches contribute; siblings that completed are
/// unaffected and their results are not carried here.
#[derive(Debug, Clone, Error)]
#[error("fan-out join failed in {count} branch(es)", count = .failures.len())]
pub struct BranchJoinError {
    /// The failures contributed by individual branches, in dispatch order.
    pub failures: Vec<DispatchError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_display() {
        assert_eq!(BuildError::MissingHandler.to_string(), "chain has no handler");
        assert_eq!(
            BuildError::HandlerAlreadySet.to_string(),
            "chain already has a handler"
        );
        assert_eq!(
            BuildError::invalid_config("concurrency must be at least 1").to_string(),
            "invalid configuration: concurrency must be at least 1"
        );
    }

    #[test]
    fn test_dispatch_error_cancelled() {
        let err = DispatchError::cancelled("shutdown");
        assert!(err.is_cancelled());
        assert!(!DispatchError::handler("boom").is_cancelled());
    }

    #[test]
    fn test_retry_exhausted_carries_all_causes() {
        let err = RetryExhaustedError {
            causes: vec![
                DispatchError::handler("attempt 1"),
                DispatchError::handler("attempt 2"),
            ],
            attempts: 2,
            delay_ms: 100,
        };

        assert_eq!(err.causes.len(), 2);
        assert_eq!(
            err.to_string(),
            "retry exhausted after 2 attempts (base delay 100ms)"
        );

        let wrapped: DispatchError = err.into();
        assert!(matches!(wrapped, DispatchError::RetryExhausted(_)));
    }

    #[test]
    fn test_branch_join_display() {
        let err = BranchJoinError {
            failures: vec![DispatchError::handler("left failed")],
        };
        assert_eq!(err.to_string(), "fan-out join failed in 1 branch(es)");
    }
}
