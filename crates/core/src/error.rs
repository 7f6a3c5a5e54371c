//! Error taxonomy shared by all components.

use std::time::Duration;

use thiserror::Error;

/// Result type used across the components.
pub type StrandResult<T> = Result<T, StrandError>;

/// Component-level error.
///
/// Failures of individual units of work (a job, a stage item, a delivery) are
/// NOT represented here; those are carried in results and counters. This enum
/// covers what a caller of a component operation gets back synchronously.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrandError {
    /// Submission or send attempted after the queue was closed.
    #[error("queue closed")]
    QueueClosed,

    /// A non-blocking send found no capacity.
    #[error("queue full")]
    QueueFull,

    /// The circuit breaker rejected the call without running it.
    #[error("circuit open")]
    CircuitOpen,

    /// The rate limiter denied the call or its deadline passed.
    #[error("rate limited")]
    RateLimited,

    /// The operation was aborted through its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// A bounded graceful shutdown did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid construction parameters (programmer error).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A textual identifier failed to parse.
    #[error("invalid id: {0}")]
    InvalidId(String),
}

impl StrandError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Whether a caller may reasonably retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrandError::QueueFull | StrandError::CircuitOpen | StrandError::RateLimited
        )
    }

    /// Whether this error is a cancellation rather than a domain failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StrandError::Cancelled)
    }
}
