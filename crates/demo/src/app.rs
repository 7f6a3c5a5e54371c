//! Wires the components together and runs one batch of jobs.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use strand_core::{CancellationToken, SharedSink, StrandError, TracingSink};
use strand_pool::{Job, JobFailure, JobResult, PoolConfig, PoolStats, WorkerPool};
use strand_pubsub::{
    CategoryFilter, ChannelSubscriber, FnSubscriber, Hub, HubConfig, Notification, Priority,
    ShutdownReport, SubscriberStats,
};
use strand_resilience::{
    BreakerConfig, BreakerError, BreakerStats, CircuitBreaker, LimiterStats, RateLimiter,
};
use strand_stream::{Pipeline, StageFailure, drain, fan_out_fan_in, from_iter, map_ok, try_map};

use crate::config::DemoConfig;
use crate::service::FlakyService;

pub const CATEGORY_SUCCEEDED: &str = "job.succeeded";
pub const CATEGORY_FAILED: &str = "job.failed";

const SERVICE_LATENCY: Duration = Duration::from_millis(2);
const HUB_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the hub fans out for every finished job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub request: u64,
    pub value: Option<u64>,
    pub error: Option<String>,
}

/// Totals computed by the post-processing pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostProcessing {
    pub succeeded: u64,
    pub failed: u64,
    pub checksum: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoSummary {
    pub config: DemoConfig,
    pub pool: PoolStats,
    pub limiter: LimiterStats,
    pub breaker: BreakerStats,
    /// Calls that reached the service (breaker rejections excluded)
    pub service_calls: u64,
    pub hub: ShutdownReport,
    pub subscribers: Vec<SubscriberStats>,
    /// Reports read off the audit subscriber's channel
    pub audit_received: u64,
    pub post_processing: PostProcessing,
}

/// Run `config.jobs` requests through the limiter, pool and breaker, fan the
/// per-job reports out through the hub, and post-process the results.
pub async fn run(config: DemoConfig) -> anyhow::Result<DemoSummary> {
    config.validate()?;

    let sink: SharedSink = Arc::new(TracingSink);
    let token = CancellationToken::new();

    let limiter = RateLimiter::new(config.rate_burst, config.rate_per_sec)?
        .with_name("ingress")
        .with_sink(sink.clone());
    let breaker = Arc::new(CircuitBreaker::new(
        BreakerConfig::new(config.breaker_failures, config.breaker_timeout())
            .with_name("downstream")
            .with_sink(sink.clone()),
    )?);
    let service = Arc::new(FlakyService::new(config.failure_every, SERVICE_LATENCY));
    let hub: Arc<Hub<JobReport>> = Arc::new(Hub::new(
        HubConfig::default().with_name("reports").with_sink(sink.clone()),
    )?);

    let (audit, mut audit_rx) = ChannelSubscriber::new("audit", CategoryFilter::all(), 64);
    let alerts = FnSubscriber::new(
        "alerts",
        CategoryFilter::only([CATEGORY_FAILED]),
        |n: &Notification<JobReport>| {
            tracing::warn!(request = n.payload.request, error = ?n.payload.error, "job failure alert");
            Ok(())
        },
    );
    let handles = vec![hub.subscribe(audit)?, hub.subscribe(alerts)?];

    // The channel closes once the hub shuts down and drops the subscriber.
    let audit_task = tokio::spawn(async move {
        let mut received = 0u64;
        while audit_rx.recv().await.is_some() {
            received += 1;
        }
        received
    });

    let handler = {
        let breaker = breaker.clone();
        let service = service.clone();
        let hub = hub.clone();
        move |job: Job<u64>| {
            let breaker = breaker.clone();
            let service = service.clone();
            let hub = hub.clone();
            async move {
                let request = job.into_payload();
                let (category, report, result) = match breaker.call(|| service.call(request)).await {
                    Ok(value) => (
                        CATEGORY_SUCCEEDED,
                        JobReport {
                            request,
                            value: Some(value),
                            error: None,
                        },
                        Ok(value),
                    ),
                    Err(err) => {
                        let failure = match err {
                            BreakerError::Open => JobFailure::from_error(StrandError::CircuitOpen),
                            BreakerError::Inner(err) => JobFailure::from_error(err),
                        };
                        let report = JobReport {
                            request,
                            value: None,
                            error: Some(failure.message.clone()),
                        };
                        (CATEGORY_FAILED, report, Err(failure))
                    }
                };

                let priority = if result.is_ok() { Priority::Normal } else { Priority::High };
                hub.publish(Notification::new(category, report).with_priority(priority));
                result
            }
        }
    };

    let (pool, results) = WorkerPool::start(
        PoolConfig::new(config.workers, config.queue_capacity)
            .with_name("demo")
            .with_sink(sink.clone()),
        handler,
    )?;

    for request in 0..config.jobs {
        limiter.wait(&token).await?;
        pool.submit(request).await?;
    }
    pool.close();

    let results = results.collect().await;
    let post_processing = post_process(results, config.workers, sink).await?;

    let hub_report = hub.shutdown(HUB_DRAIN_TIMEOUT).await?;
    let audit_received = audit_task.await?;

    let summary = DemoSummary {
        pool: pool.stats(),
        limiter: limiter.stats(),
        breaker: breaker.stats(),
        service_calls: service.calls(),
        hub: hub_report,
        subscribers: handles.iter().map(|h| h.stats()).collect(),
        audit_received,
        post_processing,
        config,
    };

    info!(
        jobs = summary.config.jobs,
        succeeded = summary.pool.jobs_succeeded,
        failed = summary.pool.jobs_failed,
        trips = summary.breaker.trips,
        "demo finished"
    );
    Ok(summary)
}

/// Unwrap job outcomes through a pipeline, then reduce them on `workers`
/// parallel consumers.
async fn post_process(
    results: Vec<JobResult<u64>>,
    workers: usize,
    sink: SharedSink,
) -> anyhow::Result<PostProcessing> {
    let pipeline = Pipeline::<JobResult<u64>, JobResult<u64>>::builder(8)
        .with_sink(sink)
        .stage(try_map("outcome", |r: JobResult<u64>| r.outcome))
        .stage(map_ok("root", |v: u64| (v as f64).sqrt().round() as u64))
        .build();

    let unwrapped = pipeline.run(from_iter(results, 8));
    let reduced = fan_out_fan_in(
        unwrapped,
        workers,
        8,
        |item: Result<u64, StageFailure>| async move { item.map(|v| v % 1_000_003) },
    )?;

    let mut post = PostProcessing::default();
    for item in drain(reduced).await {
        match item {
            Ok(v) => {
                post.succeeded += 1;
                post.checksum = post.checksum.wrapping_add(v);
            }
            Err(_) => post.failed += 1,
        }
    }
    Ok(post)
}
