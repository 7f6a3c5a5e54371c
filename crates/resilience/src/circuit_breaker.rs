//! Circuit breaker around a fallible async operation.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failures >= max_failures]-------------> Open
//! Open     --[timeout elapsed, next call]-----------> HalfOpen (one trial)
//! HalfOpen --[trial succeeds]-----------------------> Closed (failures = 0)
//! HalfOpen --[trial fails or is dropped]------------> Open   (timer restarts)
//! ```
//!
//! The failure counter is reset only by a success: in Closed, or by the
//! trial that closes the circuit. Entering Open leaves it at the threshold.
//!
//! # Thread Safety
//!
//! State lives behind a `Mutex` that is never held across the wrapped
//! operation, so any number of tasks may call through one breaker. Only one of
//! them wins the HalfOpen trial; the rest are rejected as if the circuit were
//! still open.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use strand_core::{ComponentEvent, SharedSink, StrandError, StrandResult};

/// Breaker configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Name for logging
    pub name: String,
    /// Consecutive failures that open the circuit (>= 1)
    pub max_failures: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub timeout: Duration,
    #[serde(skip)]
    pub sink: Option<SharedSink>,
}

impl std::fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("name", &self.name)
            .field("max_failures", &self.max_failures)
            .field("timeout", &self.timeout)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "circuit-breaker".to_string(),
            max_failures: 5,
            timeout: Duration::from_secs(30),
            sink: None,
        }
    }
}

impl BreakerConfig {
    pub fn new(max_failures: u32, timeout: Duration) -> Self {
        Self {
            max_failures,
            timeout,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn validate(&self) -> StrandResult<()> {
        if self.max_failures == 0 {
            return Err(StrandError::invalid_config("max_failures must be >= 1"));
        }
        Ok(())
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected without running the operation.
    Open,
    /// One trial call is in flight; everyone else is rejected.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError<E> {
    /// Rejected; the operation was not run.
    #[error("circuit open")]
    Open,

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

/// Folds a breaker around a [`StrandError`]-returning operation back into the
/// shared taxonomy: a rejection becomes [`StrandError::CircuitOpen`].
impl<E> From<BreakerError<E>> for StrandError
where
    E: Into<StrandError>,
{
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open => StrandError::CircuitOpen,
            BreakerError::Inner(e) => e.into(),
        }
    }
}

/// Breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: u32,
    /// Calls made, admitted or not
    pub calls: u64,
    /// Calls rejected without running the operation
    pub rejections: u64,
    pub successes: u64,
    pub failures: u64,
    /// Transitions into Open
    pub trips: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    /// When the circuit last opened
    opened_at: Option<Instant>,
    calls: u64,
    rejections: u64,
    successes: u64,
    total_failures: u64,
    trips: u64,
}

type Transition = (BreakerState, BreakerState);

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Circuit breaker.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use strand_resilience::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
///
/// # tokio_test_block_on(async {
/// let breaker = CircuitBreaker::new(BreakerConfig::new(1, Duration::from_secs(5))).unwrap();
///
/// let failed: Result<(), _> = breaker.call(|| async { Err("boom") }).await;
/// assert_eq!(failed, Err(BreakerError::Inner("boom")));
/// assert_eq!(breaker.state(), BreakerState::Open);
///
/// let rejected = breaker.call(|| async { Ok::<_, &str>(()) }).await;
/// assert_eq!(rejected, Err(BreakerError::Open));
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(f)
/// # }
/// ```
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    timeout: Duration,
    sink: Option<SharedSink>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("max_failures", &self.max_failures)
            .field("timeout", &self.timeout)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> StrandResult<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name,
            max_failures: config.max_failures,
            timeout: config.timeout,
            sink: config.sink,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                calls: 0,
                rejections: 0,
                successes: 0,
                total_failures: 0,
                trips: 0,
            }),
        })
    }

    /// Run `op` through the breaker.
    ///
    /// While the circuit is open, `op` is not called and
    /// [`BreakerError::Open`] comes back immediately.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;

        // A trial future dropped mid-flight must not leave the breaker stuck
        // in HalfOpen.
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = op().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success(admission == Admission::Trial);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(admission == Admission::Trial);
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Current state.
    ///
    /// An open circuit whose timeout has elapsed still reads `Open` until the
    /// next call takes the trial.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            state: inner.state,
            failure_count: inner.failures,
            calls: inner.calls,
            rejections: inner.rejections,
            successes: inner.successes,
            failures: inner.total_failures,
            trips: inner.trips,
        }
    }

    /// Force the circuit closed and clear the failure counter.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failures = 0;
            inner.opened_at = None;
            Self::transition(&mut inner, BreakerState::Closed)
        };
        self.announce(transition);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit<E>(&self) -> Result<Admission, BreakerError<E>> {
        let (admission, transition) = {
            let mut inner = self.lock();
            inner.calls += 1;

            match inner.state {
                BreakerState::Closed => (Some(Admission::Normal), None),
                BreakerState::Open => {
                    let cooled = inner
                        .opened_at
                        .is_none_or(|at| at.elapsed() >= self.timeout);
                    if cooled {
                        let t = Self::transition(&mut inner, BreakerState::HalfOpen);
                        (Some(Admission::Trial), t)
                    } else {
                        inner.rejections += 1;
                        (None, None)
                    }
                }
                // The trial is already taken.
                BreakerState::HalfOpen => {
                    inner.rejections += 1;
                    (None, None)
                }
            }
        };
        self.announce(transition);

        match admission {
            Some(admission) => Ok(admission),
            None => {
                debug!(breaker = %self.name, "call rejected; circuit open");
                Err(BreakerError::Open)
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            inner.successes += 1;
            if trial {
                inner.failures = 0;
                Self::transition(&mut inner, BreakerState::Closed)
            } else {
                // Stragglers admitted before the circuit opened do not close it.
                if inner.state == BreakerState::Closed {
                    inner.failures = 0;
                }
                None
            }
        };
        self.announce(transition);
    }

    fn on_failure(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            inner.total_failures += 1;

            let open = if trial {
                inner.failures = self.max_failures;
                true
            } else if inner.state == BreakerState::Closed {
                inner.failures = inner.failures.saturating_add(1);
                inner.failures >= self.max_failures
            } else {
                false
            };

            if open {
                inner.opened_at = Some(Instant::now());
                inner.trips += 1;
                Self::transition(&mut inner, BreakerState::Open)
            } else {
                None
            }
        };
        self.announce(transition);
    }

    fn transition(inner: &mut Inner, to: BreakerState) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        Some((from, to))
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            BreakerState::Open => {
                warn!(breaker = %self.name, from = from.as_str(), timeout = ?self.timeout, "circuit opened")
            }
            _ => info!(breaker = %self.name, from = from.as_str(), to = to.as_str(), "circuit transition"),
        }
        if let Some(sink) = &self.sink {
            sink.record(&ComponentEvent::BreakerTransition {
                breaker: self.name.clone(),
                from: from.as_str(),
                to: to.as_str(),
            });
        }
    }
}

/// Re-opens the circuit if a trial call is dropped before it completes.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(breaker = %self.breaker.name, "trial call abandoned; reopening circuit");
            self.breaker.on_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use strand_core::RecordingSink;

    fn breaker(max_failures: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::new(max_failures, Duration::from_millis(timeout_ms))).unwrap()
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Err("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_folds_into_circuit_open() {
        async fn guarded(breaker: &CircuitBreaker) -> StrandResult<u32> {
            let n = breaker
                .call(|| async { Err::<u32, _>(StrandError::QueueFull) })
                .await?;
            Ok(n)
        }

        let breaker = breaker(1, 1000);
        assert_eq!(guarded(&breaker).await, Err(StrandError::QueueFull));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(guarded(&breaker).await, Err(StrandError::CircuitOpen));
        assert!(StrandError::from(BreakerError::<StrandError>::Open).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_running() {
        let breaker = breaker(3, 1000);
        for _ in 0..2 {
            assert_eq!(fail(&breaker).await, Err(BreakerError::Inner("boom")));
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.failure_count(), 3);

        let ran = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert_eq!(result, Err(BreakerError::Open));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_count() {
        let breaker = breaker(3, 1000);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.failure_count(), 0);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_closes() {
        let breaker = breaker(1, 500);
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens_and_restarts_timer() {
        let breaker = breaker(2, 500);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(600)).await;

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.failure_count(), 2);

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(succeed(&breaker).await, Err(BreakerError::Open));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.stats().trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_under_contention() {
        let breaker = Arc::new(breaker(1, 100));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(100)).await;

        let gate = Arc::new(tokio::sync::Notify::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let trial = {
            let breaker = breaker.clone();
            let gate = gate.clone();
            let ran = ran.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        for _ in 0..5 {
            assert_eq!(succeed(&breaker).await, Err(BreakerError::Open));
        }

        gate.notify_one();
        trial.await.unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().rejections, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_reopens() {
        let breaker = breaker(1, 100);
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(100)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| async {
                std::future::pending::<()>().await;
                Ok::<_, &str>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(succeed(&breaker).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_reach_the_sink() {
        let sink = Arc::new(RecordingSink::new());
        let breaker = CircuitBreaker::new(
            BreakerConfig::new(1, Duration::from_millis(10))
                .with_name("db")
                .with_sink(sink.clone()),
        )
        .unwrap();

        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(10)).await;
        succeed(&breaker).await.unwrap();

        let path: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ComponentEvent::BreakerTransition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            path,
            vec![("closed", "open"), ("open", "half_open"), ("half_open", "closed")]
        );
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = CircuitBreaker::new(BreakerConfig::new(0, Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, StrandError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn reset_closes_immediately() {
        let breaker = breaker(1, 60_000);
        fail(&breaker).await.unwrap_err();
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(succeed(&breaker).await, Ok(7));
    }
}
