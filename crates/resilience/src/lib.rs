//! Call-site guards: token-bucket rate limiting, circuit breaking and retry.
//!
//! All three wrap an arbitrary async operation and compose in the usual
//! order:
//!
//! ```text
//! Retry ──▶ CircuitBreaker ──▶ raw call
//! ```
//!
//! with a [`RateLimiter`] gating admission in front of any of them. Time is
//! read from `tokio::time`, so tests can drive every guard on a paused clock.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, BreakerError, BreakerState, BreakerStats, CircuitBreaker};
pub use rate_limiter::{LimiterStats, RateLimiter};
pub use retry::{BackoffStrategy, Retry, RetryError, RetryPolicy};
