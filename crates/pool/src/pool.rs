//! Worker pool with bounded queue, panic isolation and graceful shutdown.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

use strand_core::{
    CancellationToken, ComponentEvent, JobId, SharedSink, StrandError, StrandResult,
    cancelled_or,
};

use crate::job::{Job, JobFailure, JobResult};
use crate::results::Results;

/// Worker pool configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Name for logging
    pub name: String,
    /// Number of concurrent workers (>= 1)
    pub workers: usize,
    /// Job queue capacity; 0 means synchronous handoff
    pub queue_capacity: usize,
    /// Optional observability callback
    #[serde(skip)]
    pub sink: Option<SharedSink>,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "worker-pool".to_string(),
            workers: 4,
            queue_capacity: 64,
            sink: None,
        }
    }
}

impl PoolConfig {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            workers,
            queue_capacity,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn validate(&self) -> StrandResult<()> {
        if self.workers == 0 {
            return Err(StrandError::invalid_config("workers must be >= 1"));
        }
        Ok(())
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub jobs_submitted: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_panicked: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    running: AtomicUsize,
    /// Workers waiting on the queue, less handoffs already claimed by
    /// `try_submit`. Briefly negative while a worker races a claim.
    idle: AtomicI64,
}

impl Counters {
    /// Claim one waiting worker for a synchronous handoff.
    fn claim_idle(&self) -> bool {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then(|| n - 1))
            .is_ok()
    }
}

/// What actually travels through the job queue.
struct Envelope<P> {
    job: Job<P>,
    /// Set in synchronous-handoff mode; fired when a worker takes the job.
    accepted: Option<oneshot::Sender<()>>,
    /// The submitter already claimed an idle worker for this job.
    claimed: bool,
}

type Queue<P> = Arc<AsyncMutex<mpsc::Receiver<Envelope<P>>>>;

/// Fixed-size pool of workers sharing one job queue.
///
/// Workers are spawned on the current tokio runtime by [`start`](Self::start)
/// and block on the queue until it is closed and drained.
pub struct WorkerPool<P> {
    name: String,
    workers: usize,
    synchronous: bool,
    sender: Mutex<Option<mpsc::Sender<Envelope<P>>>>,
    tracker: TaskTracker,
    stop: CancellationToken,
    counters: Arc<Counters>,
    started: Instant,
}

impl<P> std::fmt::Debug for WorkerPool<P>
where
    P: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("synchronous", &self.synchronous)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<P> WorkerPool<P>
where
    P: Send + 'static,
{
    /// Spawn `config.workers` workers running `handler` and return the
    /// submission side plus the result queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R, H, Fut>(config: PoolConfig, handler: H) -> StrandResult<(Self, Results<R>)>
    where
        R: Send + 'static,
        H: Fn(Job<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobFailure>> + Send + 'static,
    {
        config.validate()?;

        let synchronous = config.queue_capacity == 0;
        // tokio channels need at least one slot; synchronous mode adds an
        // acceptance handshake on top of it.
        let (job_tx, job_rx) = mpsc::channel::<Envelope<P>>(config.queue_capacity.max(1));
        let (result_tx, result_rx) = mpsc::unbounded_channel::<JobResult<R>>();

        let queue: Queue<P> = Arc::new(AsyncMutex::new(job_rx));
        let handler = Arc::new(handler);
        let counters = Arc::new(Counters::default());
        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();

        for worker in 0..config.workers {
            let ctx = WorkerContext {
                pool: config.name.clone(),
                worker,
                queue: queue.clone(),
                results: result_tx.clone(),
                handler: handler.clone(),
                counters: counters.clone(),
                stop: stop.clone(),
                sink: config.sink.clone(),
            };
            let span = tracing::debug_span!("worker", pool = %config.name, worker);
            tracker.spawn(worker_loop(ctx).instrument(span));
        }
        tracker.close();

        info!(
            pool = %config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        let pool = Self {
            name: config.name,
            workers: config.workers,
            synchronous,
            sender: Mutex::new(Some(job_tx)),
            tracker,
            stop,
            counters,
            started: Instant::now(),
        };

        Ok((pool, Results::new(result_rx)))
    }

    fn sender(&self) -> StrandResult<mpsc::Sender<Envelope<P>>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StrandError::QueueClosed)
    }

    /// Submit a job, suspending while the queue is full.
    ///
    /// In synchronous-handoff mode (`queue_capacity == 0`) this returns only
    /// once a worker has taken the job.
    pub async fn submit(&self, payload: P) -> StrandResult<JobId> {
        let sender = self.sender()?;
        let job = Job::new(payload);
        let id = job.id;

        if self.synchronous {
            let (ack_tx, ack_rx) = oneshot::channel();
            sender
                .send(Envelope {
                    job,
                    accepted: Some(ack_tx),
                    claimed: false,
                })
                .await
                .map_err(|_| StrandError::QueueClosed)?;
            drop(sender);
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            // The envelope is dropped unacknowledged only on force-stop.
            ack_rx.await.map_err(|_| StrandError::QueueClosed)?;
        } else {
            sender
                .send(Envelope {
                    job,
                    accepted: None,
                    claimed: false,
                })
                .await
                .map_err(|_| StrandError::QueueClosed)?;
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        }

        debug!(pool = %self.name, job_id = %id, "job submitted");
        Ok(id)
    }

    /// Like [`submit`](Self::submit), but gives up with
    /// [`StrandError::Cancelled`] when `token` fires.
    ///
    /// If cancellation lands while waiting for queue space, the job is not
    /// enqueued. In synchronous mode a job already handed to the queue may
    /// still run even though the caller saw `Cancelled`.
    pub async fn submit_until(&self, payload: P, token: &CancellationToken) -> StrandResult<JobId> {
        cancelled_or(token, self.submit(payload)).await?
    }

    /// Submit without waiting; fails with [`StrandError::QueueFull`] when no
    /// slot is free.
    ///
    /// In synchronous mode there is no slot to wait in: the job is accepted
    /// only if a worker is already waiting for it.
    pub fn try_submit(&self, payload: P) -> StrandResult<JobId> {
        let sender = self.sender()?;
        let job = Job::new(payload);
        let id = job.id;

        let claimed = self.synchronous;
        if claimed && !self.counters.claim_idle() {
            return Err(StrandError::QueueFull);
        }

        match sender.try_send(Envelope {
            job,
            accepted: None,
            claimed,
        }) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(err) => {
                if claimed {
                    self.counters.idle.fetch_add(1, Ordering::AcqRel);
                }
                match err {
                    TrySendError::Full(_) => Err(StrandError::QueueFull),
                    TrySendError::Closed(_) => Err(StrandError::QueueClosed),
                }
            }
        }
    }

    /// Signal that no more jobs will be submitted.
    ///
    /// Workers drain what is already queued, then exit. Idempotent.
    pub fn close(&self) {
        let taken = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            info!(pool = %self.name, "worker pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Wait until every worker has exited.
    ///
    /// Only completes after [`close`](Self::close) (or the pool being dropped)
    /// and the queue draining, or after a force-stop.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Whether every worker has exited.
    pub fn is_finished(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }

    /// Close, drain for up to `timeout`, then force-stop.
    ///
    /// Returns [`StrandError::Timeout`] if workers had to be stopped with jobs
    /// still queued or running; those jobs produce no result.
    pub async fn shutdown(&self, timeout: Duration) -> StrandResult<()> {
        self.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            info!(pool = %self.name, "worker pool drained");
            return Ok(());
        }

        warn!(pool = %self.name, ?timeout, "drain timed out; force-stopping workers");
        self.stop.cancel();
        self.tracker.wait().await;
        Err(StrandError::Timeout(timeout))
    }

    /// Stop workers immediately without draining.
    pub fn abort(&self) {
        self.close();
        self.stop.cancel();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            workers: self.workers,
            jobs_submitted: c.submitted.load(Ordering::Relaxed),
            jobs_processed: c.processed.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_failed: c.failed.load(Ordering::Relaxed),
            jobs_panicked: c.panicked.load(Ordering::Relaxed),
            current_running: c.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

struct WorkerContext<P, R, H> {
    pool: String,
    worker: usize,
    queue: Queue<P>,
    results: mpsc::UnboundedSender<JobResult<R>>,
    handler: Arc<H>,
    counters: Arc<Counters>,
    stop: CancellationToken,
    sink: Option<SharedSink>,
}

async fn worker_loop<P, R, H, Fut>(ctx: WorkerContext<P, R, H>)
where
    P: Send + 'static,
    R: Send + 'static,
    H: Fn(Job<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, JobFailure>> + Send + 'static,
{
    debug!("worker started");

    loop {
        ctx.counters.idle.fetch_add(1, Ordering::AcqRel);
        let next = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => break,
            next = next_envelope(&ctx.queue) => next,
        };
        let Some(envelope) = next else {
            break;
        };
        if !envelope.claimed {
            ctx.counters.idle.fetch_sub(1, Ordering::AcqRel);
        }

        if let Some(ack) = envelope.accepted {
            let _ = ack.send(());
        }

        let job_id = envelope.job.id;
        ctx.counters.running.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        // Run on its own task so a panicking handler is contained.
        let mut task = tokio::spawn((ctx.handler)(envelope.job));
        let joined = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => {
                task.abort();
                ctx.counters.running.fetch_sub(1, Ordering::Relaxed);
                warn!(job_id = %job_id, "job abandoned by force-stop");
                break;
            }
            joined = &mut task => joined,
        };

        let elapsed = started.elapsed();
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => {
                ctx.counters.panicked.fetch_add(1, Ordering::Relaxed);
                Err(JobFailure::panic(panic_message(err.into_panic())))
            }
            Err(_) => Err(JobFailure::new("job task cancelled")),
        };

        let c = &ctx.counters;
        c.running.fetch_sub(1, Ordering::Relaxed);
        c.processed.fetch_add(1, Ordering::Relaxed);
        match &outcome {
            Ok(_) => {
                c.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job_id, ?elapsed, "job completed successfully");
            }
            Err(failure) => {
                c.failed.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job_id, error = %failure, panicked = failure.panicked, "job failed");
            }
        }

        if let Some(sink) = &ctx.sink {
            sink.record(&ComponentEvent::JobFinished {
                pool: ctx.pool.clone(),
                job_id,
                worker: ctx.worker,
                success: outcome.is_ok(),
                elapsed,
            });
        }

        // Nobody listening is fine; the job still counts as processed.
        let _ = ctx.results.send(JobResult {
            job_id,
            worker: ctx.worker,
            elapsed,
            outcome,
        });
    }

    debug!("worker stopped");
}

async fn next_envelope<P>(queue: &Queue<P>) -> Option<Envelope<P>> {
    let mut rx = queue.lock().await;
    rx.recv().await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use proptest::prelude::*;

    async fn double(job: Job<u64>) -> Result<u64, JobFailure> {
        Ok(job.payload * 2)
    }

    #[tokio::test]
    async fn processes_every_job_once() {
        let (pool, results) = WorkerPool::start(PoolConfig::new(3, 4), double).unwrap();

        let mut ids = HashSet::new();
        for n in 0..10 {
            ids.insert(pool.submit(n).await.unwrap());
        }
        pool.close();

        let all = results.collect().await;
        assert_eq!(all.len(), 10);
        let seen: HashSet<_> = all.iter().map(|r| r.job_id).collect();
        assert_eq!(seen, ids);

        let mut values: Vec<u64> = all.into_iter().map(|r| r.outcome.unwrap()).collect();
        values.sort();
        assert_eq!(values, (0..10).map(|n| n * 2).collect::<Vec<_>>());

        pool.wait().await;
        assert!(pool.is_finished());
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let err = WorkerPool::start(PoolConfig::new(0, 4), double).unwrap_err();
        assert!(matches!(err, StrandError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn failures_are_results_not_crashes() {
        let (pool, results) = WorkerPool::start(PoolConfig::new(2, 8), |job: Job<u32>| async move {
            if job.payload % 2 == 0 {
                Err(JobFailure::new(format!("even payload {}", job.payload)))
            } else {
                Ok(job.payload)
            }
        })
        .unwrap();

        for n in 0..6 {
            pool.submit(n).await.unwrap();
        }
        pool.close();

        let all = results.collect().await;
        assert_eq!(all.len(), 6);
        assert_eq!(all.iter().filter(|r| r.is_success()).count(), 3);

        let stats = pool.stats();
        assert_eq!(stats.jobs_processed, 6);
        assert_eq!(stats.jobs_failed, 3);
        assert_eq!(stats.jobs_succeeded, 3);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_worker() {
        let (pool, results) = WorkerPool::start(PoolConfig::new(1, 8), |job: Job<u32>| async move {
            if job.payload == 1 {
                panic!("boom");
            }
            Ok::<_, JobFailure>(job.payload)
        })
        .unwrap();

        for n in 0..3 {
            pool.submit(n).await.unwrap();
        }
        pool.close();

        let all = results.collect().await;
        assert_eq!(all.len(), 3);
        let panicked: Vec<_> = all
            .iter()
            .filter_map(|r| r.outcome.as_ref().err())
            .collect();
        assert_eq!(panicked.len(), 1);
        assert!(panicked[0].panicked);
        assert!(panicked[0].message.contains("boom"));
        assert_eq!(pool.stats().jobs_panicked, 1);
    }

    #[tokio::test]
    async fn submit_after_close_is_rejected() {
        let (pool, _results) = WorkerPool::start(PoolConfig::new(1, 1), double).unwrap();
        pool.close();
        pool.close();
        assert_eq!(pool.submit(1).await, Err(StrandError::QueueClosed));
        assert_eq!(pool.try_submit(1), Err(StrandError::QueueClosed));
    }

    #[tokio::test]
    async fn try_submit_reports_full_queue() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let worker_gate = gate.clone();
        let (pool, results) = WorkerPool::start(PoolConfig::new(1, 1), move |job: Job<u32>| {
            let gate = worker_gate.clone();
            async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                Ok::<_, JobFailure>(job.payload)
            }
        })
        .unwrap();

        // First job is taken by the worker, second fills the single slot.
        pool.submit(0).await.unwrap();
        while pool.stats().current_running == 0 {
            tokio::task::yield_now().await;
        }
        pool.try_submit(1).unwrap();
        assert_eq!(pool.try_submit(2), Err(StrandError::QueueFull));

        gate.add_permits(2);
        pool.close();
        assert_eq!(results.collect().await.len(), 2);
    }

    #[tokio::test]
    async fn synchronous_try_submit_needs_a_waiting_worker() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let worker_gate = gate.clone();
        let (pool, mut results) = WorkerPool::start(PoolConfig::new(1, 0), move |job: Job<u32>| {
            let gate = worker_gate.clone();
            async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                Ok::<_, JobFailure>(job.payload)
            }
        })
        .unwrap();

        // Let the worker reach the queue.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        pool.try_submit(1).unwrap();
        // The claimed worker is gone even before it picks the job up.
        assert_eq!(pool.try_submit(2), Err(StrandError::QueueFull));

        while pool.stats().current_running == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.try_submit(3), Err(StrandError::QueueFull));
        assert_eq!(pool.stats().jobs_submitted, 1);

        gate.add_permits(1);
        assert_eq!(results.recv().await.unwrap().outcome, Ok(1));
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        pool.try_submit(4).unwrap();

        gate.add_permits(1);
        pool.close();
        assert_eq!(results.collect().await.len(), 1);
        assert_eq!(pool.stats().jobs_processed, 2);
    }

    #[tokio::test]
    async fn synchronous_handoff_waits_for_worker() {
        let taken = Arc::new(AtomicUsize::new(0));
        let counter = taken.clone();
        let (pool, results) = WorkerPool::start(PoolConfig::new(2, 0), move |job: Job<u32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, JobFailure>(job.payload) }
        })
        .unwrap();

        for n in 0..5 {
            pool.submit(n).await.unwrap();
        }
        pool.close();
        assert_eq!(results.collect().await.len(), 5);
        assert_eq!(taken.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_until_honours_cancellation() {
        let (pool, _results) = WorkerPool::start(PoolConfig::new(1, 1), |job: Job<u32>| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, JobFailure>(job.payload)
        })
        .unwrap();

        pool.submit(0).await.unwrap(); // taken by the worker
        pool.submit(1).await.unwrap(); // fills the queue

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        assert_eq!(pool.submit_until(2, &token).await, Err(StrandError::Cancelled));
        pool.abort();
        pool.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_force_stops_after_timeout() {
        let (pool, results) = WorkerPool::start(PoolConfig::new(1, 4), |job: Job<u32>| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, JobFailure>(job.payload)
        })
        .unwrap();

        pool.submit(1).await.unwrap();
        pool.submit(2).await.unwrap();

        let outcome = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(outcome, Err(StrandError::Timeout(Duration::from_secs(1))));
        assert!(pool.is_finished());
        assert!(results.collect().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_queue() {
        let (pool, results) = WorkerPool::start(PoolConfig::new(2, 16), double).unwrap();
        for n in 0..16 {
            pool.submit(n).await.unwrap();
        }
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(results.collect().await.len(), 16);
    }

    #[tokio::test]
    async fn sink_sees_every_job() {
        let sink = Arc::new(strand_core::RecordingSink::new());
        let config = PoolConfig::new(2, 4)
            .with_name("sinked")
            .with_sink(sink.clone());
        let (pool, results) = WorkerPool::start(config, double).unwrap();
        for n in 0..4 {
            pool.submit(n).await.unwrap();
        }
        pool.close();
        results.collect().await;

        assert_eq!(
            sink.count(|e| matches!(e, ComponentEvent::JobFinished { pool, success: true, .. } if pool == "sinked")),
            4
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: M jobs on W workers with any queue capacity yield exactly
        /// M results with unique ids matching the submitted ones.
        #[test]
        fn no_loss_no_duplication(jobs in 0usize..60, workers in 1usize..6, capacity in 0usize..8) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async move {
                let (pool, results) =
                    WorkerPool::start(PoolConfig::new(workers, capacity), double).unwrap();

                let mut submitted = HashSet::new();
                for n in 0..jobs as u64 {
                    submitted.insert(pool.submit(n).await.unwrap());
                }
                pool.close();

                let all = results.collect().await;
                let seen: HashSet<_> = all.iter().map(|r| r.job_id).collect();
                prop_assert_eq!(all.len(), jobs);
                prop_assert_eq!(seen, submitted);
                Ok(())
            })?;
        }
    }
}
