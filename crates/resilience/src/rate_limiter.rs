//! Token-bucket rate limiter.
//!
//! The bucket starts full with `burst` tokens and gains `refill_rate` tokens
//! per second, never holding more than `burst`. Refill is computed lazily from
//! elapsed time on every access, so an idle limiter costs nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use strand_core::{CancellationToken, ComponentEvent, SharedSink, StrandError, StrandResult};

/// Absorbs float error so that waiting exactly `1 / refill_rate` yields a
/// whole token.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Admission counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub admitted: u64,
    pub denied: u64,
}

/// Token bucket shared by any number of concurrent callers.
pub struct RateLimiter {
    name: String,
    burst: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
    admitted: AtomicU64,
    denied: AtomicU64,
    sink: Option<SharedSink>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("burst", &self.burst)
            .field("refill_rate", &self.refill_rate)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter holding at most `burst` tokens and refilling
    /// `refill_rate` tokens per second.
    ///
    /// A `refill_rate` of 0 admits exactly `burst` calls over the limiter's
    /// whole lifetime.
    pub fn new(burst: u32, refill_rate: f64) -> StrandResult<Self> {
        if burst == 0 {
            return Err(StrandError::invalid_config("burst must be >= 1"));
        }
        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(StrandError::invalid_config(format!(
                "refill_rate must be a finite, non-negative number (got {refill_rate})"
            )));
        }

        Ok(Self {
            name: "rate-limiter".to_string(),
            burst: f64::from(burst),
            refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            sink: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        match self.try_acquire() {
            Ok(()) => true,
            Err(_) => {
                self.deny();
                false
            }
        }
    }

    /// Wait until a token is available and take it.
    ///
    /// Returns [`StrandError::Cancelled`] as soon as `token` fires, even while
    /// sleeping for a refill.
    pub async fn wait(&self, token: &CancellationToken) -> StrandResult<()> {
        loop {
            if token.is_cancelled() {
                return Err(StrandError::Cancelled);
            }

            let next = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(next) => next,
            };

            match next {
                Some(delay) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(StrandError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                // Nothing will ever refill the bucket.
                None => {
                    token.cancelled().await;
                    return Err(StrandError::Cancelled);
                }
            }
        }
    }

    /// Like [`wait`](Self::wait) with a deadline; gives up with
    /// [`StrandError::RateLimited`] when `timeout` elapses first.
    pub async fn wait_timeout(&self, timeout: Duration) -> StrandResult<()> {
        let token = CancellationToken::new();
        match tokio::time::timeout(timeout, self.wait(&token)).await {
            Ok(result) => result,
            Err(_) => {
                self.deny();
                Err(StrandError::RateLimited)
            }
        }
    }

    /// Whole tokens currently in the bucket.
    pub fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        (bucket.tokens + TOKEN_EPSILON).floor() as u32
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }

    /// Take one token, or report how long until the next one exists
    /// (`None` when the bucket never refills).
    fn try_acquire(&self) -> Result<(), Option<Duration>> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);

        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if self.refill_rate == 0.0 {
            return Err(None);
        }
        let missing = 1.0 - bucket.tokens;
        // A rate small enough to overflow `Duration` never refills in practice.
        Err(Duration::try_from_secs_f64(missing / self.refill_rate).ok())
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.burst);
        bucket.last = now;
    }

    fn deny(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
        debug!(limiter = %self.name, "rate limited");
        if let Some(sink) = &self.sink {
            sink.record(&ComponentEvent::RateLimited {
                limiter: self.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use proptest::prelude::*;
    use strand_core::RecordingSink;

    #[tokio::test(start_paused = true)]
    async fn burst_then_one_per_interval() {
        let limiter = RateLimiter::new(3, 2.0).unwrap();
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(limiter.stats(), LimiterStats { admitted: 4, denied: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_burst() {
        let limiter = RateLimiter::new(2, 10.0).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_admits_exactly_burst() {
        let limiter = RateLimiter::new(2, 0.0).unwrap();
        assert!(limiter.allow());
        assert!(limiter.allow());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!limiter.allow());

        let err = limiter.wait_timeout(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, StrandError::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn negligible_rate_waits_like_zero_rate() {
        let limiter = Arc::new(RateLimiter::new(1, 1e-20).unwrap());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        let err = limiter.wait_timeout(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, StrandError::RateLimited);

        let token = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.wait(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(StrandError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_until_refill() {
        let limiter = RateLimiter::new(1, 4.0).unwrap();
        let token = CancellationToken::new();
        limiter.wait(&token).await.unwrap();

        let started = Instant::now();
        limiter.wait(&token).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(249));
        assert!(started.elapsed() <= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_promptly_on_cancel() {
        let limiter = Arc::new(RateLimiter::new(1, 0.0).unwrap());
        assert!(limiter.allow());

        let token = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.wait(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(StrandError::Cancelled));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(RateLimiter::new(0, 1.0).is_err());
        assert!(RateLimiter::new(1, -1.0).is_err());
        assert!(RateLimiter::new(1, f64::NAN).is_err());
        assert!(RateLimiter::new(1, f64::INFINITY).is_err());
    }

    #[tokio::test]
    async fn denials_reach_the_sink() {
        let sink = Arc::new(RecordingSink::new());
        let limiter = RateLimiter::new(1, 0.0)
            .unwrap()
            .with_name("api")
            .with_sink(sink.clone());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(
            sink.events(),
            vec![ComponentEvent::RateLimited {
                limiter: "api".into()
            }]
        );
    }

    #[tokio::test]
    async fn concurrent_callers_never_share_a_token() {
        let limiter = Arc::new(RateLimiter::new(50, 0.0).unwrap());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                (0..20).filter(|_| limiter.allow()).count()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            admitted += task.await.unwrap();
        }
        assert_eq!(admitted, 50);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: over any run of length T, at most
        /// `burst + ceil(rate * T)` calls are admitted.
        #[test]
        fn admissions_are_bounded(
            burst in 1u32..20,
            rate in 0.0f64..50.0,
            steps in prop::collection::vec((0u64..200, 0usize..10), 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let (admitted, elapsed) = rt.block_on(async move {
                let limiter = RateLimiter::new(burst, rate).unwrap();
                let started = Instant::now();
                let mut admitted = 0u64;
                for (advance_ms, attempts) in steps {
                    tokio::time::advance(Duration::from_millis(advance_ms)).await;
                    for _ in 0..attempts {
                        if limiter.allow() {
                            admitted += 1;
                        }
                    }
                }
                (admitted, started.elapsed())
            });

            let bound = u64::from(burst) + (rate * elapsed.as_secs_f64()).ceil() as u64;
            prop_assert!(admitted <= bound, "admitted {} > bound {}", admitted, bound);
        }
    }
}
