//! Retry with backoff.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use strand_core::CancellationToken;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-indexed; 0 means no delay).
    ///
    /// Jitter is keyed on the retry number alone, so the schedule is the same
    /// on every call. [`Retry`] uses [`seeded_delay`](Self::seeded_delay)
    /// instead so concurrent callers spread out.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        self.seeded_delay(retry, 0)
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt), with the jitter
    /// offset drawn from `seed` as well as the retry number.
    pub fn seeded_delay(&self, retry: u32, seed: u64) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((retry - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(retry)).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let unit = (mix(seed ^ u64::from(retry)) >> 11) as f64 / (1u64 << 53) as f64;
            jitter_range * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another retry is allowed after `retries` retries.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_attempts
    }
}

/// splitmix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn next_seed() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    mix(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Why [`Retry::call`] gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed, or the last error was not retryable.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    /// Cancelled before an attempt could succeed.
    #[error("retry cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The last operation error, if any attempt ran to completion.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled => None,
        }
    }
}

type RetryIf<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retries a fallible async operation according to a [`RetryPolicy`].
///
/// Composes with [`CircuitBreaker`](crate::CircuitBreaker) by retrying the
/// breaker's `call`; pair it with [`retry_if`](Self::retry_if) to decide
/// whether an open circuit is worth waiting out.
///
/// Every instance, clones included, draws its own jitter seed so callers
/// failing together do not back off in lockstep.
pub struct Retry<E> {
    policy: RetryPolicy,
    retry_if: Option<RetryIf<E>>,
    seed: u64,
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            retry_if: self.retry_if.clone(),
            seed: next_seed(),
        }
    }
}

impl<E> std::fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("policy", &self.policy)
            .field("retry_if", &self.retry_if.is_some())
            .field("seed", &self.seed)
            .finish()
    }
}

impl<E> Retry<E>
where
    E: std::fmt::Display,
{
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_if: None,
            seed: next_seed(),
        }
    }

    /// Fix the jitter seed, for a reproducible schedule.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Only retry errors for which `pred` returns true; others end the call
    /// immediately.
    pub fn retry_if<F>(mut self, pred: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(pred));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay this instance sleeps before retry number `retry`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        self.policy.seeded_delay(retry, self.seed)
    }

    /// Run `op` until it succeeds, the policy is exhausted, or `token` fires.
    ///
    /// Cancellation interrupts both a running attempt and a backoff sleep.
    pub async fn call<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(RetryError::Cancelled),
                outcome = op() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if retries > 0 {
                        debug!(retries, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let attempts = retries + 1;
            let retryable = self.retry_if.as_ref().is_none_or(|pred| pred(&err));
            if !retryable || !self.policy.should_retry(retries) {
                warn!(attempts, retryable, error = %err, "giving up");
                return Err(RetryError::Exhausted { attempts, last: err });
            }

            retries += 1;
            let delay = self.delay_for_attempt(retries);
            warn!(attempt = attempts, ?delay, error = %err, "attempt failed; retrying");

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
