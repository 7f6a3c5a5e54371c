//! Observability callbacks injected into components.
//!
//! Components never depend on a concrete metrics or logging backend. They
//! report noteworthy events to an optional [`EventSink`]; what happens next
//! (log line, counter, test assertion) is up to the sink.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::id::{JobId, NotificationId, SubscriberId};

/// Shared handle to an event sink, as stored in component configs.
pub type SharedSink = Arc<dyn EventSink>;

/// Something worth reporting that happened inside a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ComponentEvent {
    /// A worker finished a job (successfully or not).
    JobFinished {
        pool: String,
        job_id: JobId,
        worker: usize,
        success: bool,
        elapsed: Duration,
    },
    /// A notification could not be queued because the subscriber was full.
    DeliveryDropped {
        subscriber: SubscriberId,
        notification: NotificationId,
    },
    /// A subscriber's delivery callback returned an error.
    DeliveryFailed {
        subscriber: SubscriberId,
        notification: NotificationId,
        error: String,
    },
    /// A circuit breaker changed state.
    BreakerTransition {
        breaker: String,
        from: &'static str,
        to: &'static str,
    },
    /// A rate limiter denied a caller.
    RateLimited { limiter: String },
    /// A pipeline stage failed on one item.
    StageFailed { stage: String, error: String },
}

/// Receiver of [`ComponentEvent`]s.
///
/// Called inline on the component's hot path: implementations must be cheap
/// and must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &ComponentEvent);
}

impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    fn record(&self, event: &ComponentEvent) {
        (**self).record(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &ComponentEvent) {}
}

/// Emits every event as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &ComponentEvent) {
        match event {
            ComponentEvent::JobFinished {
                pool,
                job_id,
                worker,
                success,
                elapsed,
            } => tracing::debug!(pool = %pool, job_id = %job_id, worker, success, ?elapsed, "job finished"),
            ComponentEvent::DeliveryDropped {
                subscriber,
                notification,
            } => tracing::warn!(subscriber = %subscriber, notification = %notification, "delivery dropped"),
            ComponentEvent::DeliveryFailed {
                subscriber,
                notification,
                error,
            } => tracing::warn!(subscriber = %subscriber, notification = %notification, error = %error, "delivery failed"),
            ComponentEvent::BreakerTransition { breaker, from, to } => {
                tracing::info!(breaker = %breaker, from, to, "circuit breaker transition")
            }
            ComponentEvent::RateLimited { limiter } => {
                tracing::debug!(limiter = %limiter, "rate limited")
            }
            ComponentEvent::StageFailed { stage, error } => {
                tracing::warn!(stage = %stage, error = %error, "stage failed on item")
            }
        }
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ComponentEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn events(&self) -> Vec<ComponentEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&ComponentEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| pred(e))
            .count()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.events()).unwrap_or(serde_json::Value::Null)
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &ComponentEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
