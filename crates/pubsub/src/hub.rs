//! The hub: subscriber registry, publish-time fan-out and delivery loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

use strand_core::{
    CancellationToken, ComponentEvent, NotificationId, SharedSink, StrandError, StrandResult,
    SubscriberId,
};

use crate::notification::Notification;
use crate::subscriber::{Subscriber, SubscriberState};

/// Hub configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Name for logging
    pub name: String,
    /// Private queue capacity for subscribers that do not choose their own
    pub default_capacity: usize,
    #[serde(skip)]
    pub sink: Option<SharedSink>,
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("name", &self.name)
            .field("default_capacity", &self.default_capacity)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "hub".to_string(),
            default_capacity: 64,
            sink: None,
        }
    }
}

impl HubConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn validate(&self) -> StrandResult<()> {
        if self.default_capacity == 0 {
            return Err(StrandError::invalid_config("default_capacity must be >= 1"));
        }
        Ok(())
    }
}

/// Outcome of one [`Hub::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub notification: NotificationId,
    /// Subscribers whose filter accepted the category
    pub matched: usize,
    /// Deliveries placed on a private queue
    pub delivered: usize,
    /// Deliveries dropped because the private queue was full
    pub dropped: usize,
}

/// Per-subscriber delivery counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub id: SubscriberId,
    pub state: SubscriberState,
    /// Notifications handed to `deliver` that returned `Ok`
    pub delivered: u64,
    /// Notifications dropped at publish time (queue full)
    pub dropped: u64,
    /// Notifications whose `deliver` returned an error
    pub failed: u64,
}

/// Totals returned by [`Hub::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// State shared between the registry entry, the delivery loop and handles.
#[derive(Debug)]
struct Shared {
    id: SubscriberId,
    state: AtomicU8,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    stop: CancellationToken,
}

impl Shared {
    fn new(id: SubscriberId) -> Self {
        Self {
            id,
            state: AtomicU8::new(SubscriberState::Registered.as_u8()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stop: CancellationToken::new(),
        }
    }

    fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SubscriberState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Move to `Running` unless already stopped.
    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            SubscriberState::Registered.as_u8(),
            SubscriberState::Running.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            id: self.id.clone(),
            state: self.state(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Caller-side view of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &SubscriberId {
        &self.shared.id
    }

    pub fn state(&self) -> SubscriberState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() != SubscriberState::Stopped
    }

    pub fn stats(&self) -> SubscriberStats {
        self.shared.stats()
    }
}

struct Entry<P> {
    subscriber: Arc<dyn Subscriber<P>>,
    queue: mpsc::Sender<Arc<Notification<P>>>,
    shared: Arc<Shared>,
}

/// Publish/subscribe hub.
///
/// Each subscriber gets a bounded private queue and its own delivery task.
/// `publish` only ever does non-blocking sends, so a slow subscriber costs
/// the publisher nothing beyond a dropped delivery.
pub struct Hub<P> {
    name: String,
    default_capacity: usize,
    sink: Option<SharedSink>,
    subscribers: RwLock<HashMap<SubscriberId, Entry<P>>>,
    tracker: TaskTracker,
    shut: AtomicBool,
    published: AtomicU64,
}

impl<P> std::fmt::Debug for Hub<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.name)
            .field("default_capacity", &self.default_capacity)
            .field("shut", &self.shut.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P> Hub<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(config: HubConfig) -> StrandResult<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name,
            default_capacity: config.default_capacity,
            sink: config.sink,
            subscribers: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shut: AtomicBool::new(false),
            published: AtomicU64::new(0),
        })
    }

    /// Register `subscriber` and start its delivery loop.
    ///
    /// Fails with [`StrandError::InvalidConfig`] if the id is already
    /// registered, and [`StrandError::QueueClosed`] after shutdown. Must be
    /// called from within a tokio runtime.
    pub fn subscribe<S>(&self, subscriber: S) -> StrandResult<SubscriptionHandle>
    where
        S: Subscriber<P>,
    {
        let subscriber: Arc<dyn Subscriber<P>> = Arc::new(subscriber);
        let id = subscriber.id();
        let capacity = subscriber
            .queue_capacity()
            .unwrap_or(self.default_capacity)
            .max(1);

        let mut registry = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        // Checked under the write lock so shutdown cannot miss a new entry.
        if self.shut.load(Ordering::Acquire) {
            return Err(StrandError::QueueClosed);
        }
        if registry.contains_key(&id) {
            return Err(StrandError::invalid_config(format!(
                "subscriber {id} is already registered"
            )));
        }

        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared::new(id.clone()));

        let span = tracing::debug_span!("subscriber", hub = %self.name, subscriber = %id);
        self.tracker.spawn(
            delivery_loop(subscriber.clone(), rx, shared.clone(), self.sink.clone()).instrument(span),
        );

        registry.insert(
            id.clone(),
            Entry {
                subscriber,
                queue: tx,
                shared: shared.clone(),
            },
        );
        info!(hub = %self.name, subscriber = %id, capacity, "subscriber registered");

        Ok(SubscriptionHandle { shared })
    }

    /// Remove a subscriber and stop its delivery loop.
    ///
    /// Notifications still sitting in its private queue are discarded.
    /// Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        match removed {
            Some(entry) => {
                entry.shared.set_state(SubscriberState::Stopped);
                entry.shared.stop.cancel();
                info!(hub = %self.name, subscriber = %id, "subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Fan `notification` out to every registered subscriber that accepts its
    /// category. Never blocks.
    ///
    /// After shutdown this does nothing and reports zero matches.
    pub fn publish(&self, notification: Notification<P>) -> PublishReport {
        let notification = Arc::new(notification);
        let mut report = PublishReport {
            notification: notification.id,
            matched: 0,
            delivered: 0,
            dropped: 0,
        };

        if self.shut.load(Ordering::Acquire) {
            debug!(hub = %self.name, notification = %notification.id, "publish after shutdown ignored");
            return report;
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let registry = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for entry in registry.values() {
            if !entry.subscriber.accepts(&notification.category) {
                continue;
            }
            report.matched += 1;

            match entry.queue.try_send(notification.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    entry.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        hub = %self.name,
                        subscriber = %entry.shared.id,
                        notification = %notification.id,
                        "subscriber queue full; delivery dropped"
                    );
                    if let Some(sink) = &self.sink {
                        sink.record(&ComponentEvent::DeliveryDropped {
                            subscriber: entry.shared.id.clone(),
                            notification: notification.id,
                        });
                    }
                }
                // Delivery loop already gone (stopped or panicked).
                Err(TrySendError::Closed(_)) => {}
            }
        }

        debug!(
            hub = %self.name,
            notification = %notification.id,
            category = %notification.category,
            matched = report.matched,
            dropped = report.dropped,
            "notification published"
        );
        report
    }

    pub fn stats(&self, id: &SubscriberId) -> Option<SubscriberStats> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|entry| entry.shared.stats())
    }

    /// Stats of every registered subscriber, ordered by id.
    pub fn all_stats(&self) -> Vec<SubscriberStats> {
        let mut stats: Vec<_> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.shared.stats())
            .collect();
        stats.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        stats
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of notifications accepted by `publish` so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting publishes and subscriptions, let every subscriber drain
    /// its queue for up to `timeout`, then stop whatever is left.
    ///
    /// Returns [`StrandError::Timeout`] when some delivery loop had to be
    /// stopped with notifications still queued. A second call returns an
    /// empty report.
    pub async fn shutdown(&self, timeout: Duration) -> StrandResult<ShutdownReport> {
        let entries: Vec<Entry<P>> = {
            let mut registry = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            self.shut.store(true, Ordering::Release);
            registry.drain().map(|(_, entry)| entry).collect()
        };
        self.tracker.close();

        let mut report = ShutdownReport {
            subscribers: entries.len(),
            ..ShutdownReport::default()
        };
        let mut stops = Vec::with_capacity(entries.len());
        for entry in entries {
            // Dropping the sender closes the queue; the loop exits once drained.
            drop(entry.queue);
            stops.push(entry.shared);
        }

        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!(hub = %self.name, ?timeout, "subscriber drain timed out; stopping delivery loops");
            for shared in &stops {
                shared.stop.cancel();
            }
            self.tracker.wait().await;
        }

        for shared in &stops {
            shared.set_state(SubscriberState::Stopped);
            report.delivered += shared.delivered.load(Ordering::Relaxed);
            report.dropped += shared.dropped.load(Ordering::Relaxed);
            report.failed += shared.failed.load(Ordering::Relaxed);
        }

        info!(
            hub = %self.name,
            subscribers = report.subscribers,
            delivered = report.delivered,
            dropped = report.dropped,
            failed = report.failed,
            "hub shut down"
        );

        if drained {
            Ok(report)
        } else {
            Err(StrandError::Timeout(timeout))
        }
    }
}

/// Marks the subscription stopped however the delivery loop exits.
struct StopOnExit(Arc<Shared>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.set_state(SubscriberState::Stopped);
    }
}

async fn delivery_loop<P>(
    subscriber: Arc<dyn Subscriber<P>>,
    mut queue: mpsc::Receiver<Arc<Notification<P>>>,
    shared: Arc<Shared>,
    sink: Option<SharedSink>,
) where
    P: Send + Sync + 'static,
{
    let _guard = StopOnExit(shared.clone());
    shared.mark_running();
    debug!("delivery loop started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some(notification) = next else {
            break;
        };

        let id = notification.id;
        let outcome = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            outcome = subscriber.deliver(notification) => outcome,
        };

        match outcome {
            Ok(()) => {
                shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(notification = %id, error = %err, "delivery failed");
                if let Some(sink) = &sink {
                    sink.record(&ComponentEvent::DeliveryFailed {
                        subscriber: shared.id.clone(),
                        notification: id,
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    debug!(
        delivered = shared.delivered.load(Ordering::Relaxed),
        "delivery loop finished"
    );
}
