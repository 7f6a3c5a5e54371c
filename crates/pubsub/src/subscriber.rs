//! Subscriber capability and the stock implementations.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use strand_core::SubscriberId;

use crate::notification::{CategoryFilter, Notification};

/// Lifecycle of a subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    /// Registered; delivery loop not yet running
    Registered,
    /// Delivery loop is consuming the private queue
    Running,
    /// Unsubscribed or shut down; never receives deliveries again
    Stopped,
}

impl SubscriberState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SubscriberState::Registered => 0,
            SubscriberState::Running => 1,
            SubscriberState::Stopped => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SubscriberState::Registered,
            1 => SubscriberState::Running,
            _ => SubscriberState::Stopped,
        }
    }
}

/// A delivery the subscriber could not handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The subscriber refused the notification.
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// Whatever the subscriber forwards to has gone away.
    #[error("subscriber disconnected")]
    Disconnected,
}

impl DeliveryError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// Something that receives notifications from a [`Hub`](crate::Hub).
///
/// `deliver` runs on the subscriber's own delivery task, one notification at
/// a time, so it may take as long as it needs without affecting anyone else.
#[async_trait]
pub trait Subscriber<P>: Send + Sync + 'static {
    /// Stable identifier, unique within a hub.
    fn id(&self) -> SubscriberId;

    /// Whether notifications of `category` should be queued for this
    /// subscriber.
    fn accepts(&self, category: &str) -> bool;

    async fn deliver(&self, notification: Arc<Notification<P>>) -> Result<(), DeliveryError>;

    /// Private queue capacity; `None` uses the hub default.
    fn queue_capacity(&self) -> Option<usize> {
        None
    }
}

/// Forwards accepted notifications into an mpsc queue.
///
/// Handy for tests and for bridging into code that already consumes
/// channels.
pub struct ChannelSubscriber<P> {
    id: SubscriberId,
    filter: CategoryFilter,
    queue_capacity: Option<usize>,
    tx: mpsc::Sender<Arc<Notification<P>>>,
}

impl<P> ChannelSubscriber<P> {
    /// Create the subscriber and the receiving end of its outbound channel.
    pub fn new(
        id: impl Into<SubscriberId>,
        filter: CategoryFilter,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Notification<P>>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Self {
            id: id.into(),
            filter,
            queue_capacity: None,
            tx,
        };
        (subscriber, rx)
    }

    /// Override the hub's default private queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}

#[async_trait]
impl<P> Subscriber<P> for ChannelSubscriber<P>
where
    P: Send + Sync + 'static,
{
    fn id(&self) -> SubscriberId {
        self.id.clone()
    }

    fn accepts(&self, category: &str) -> bool {
        self.filter.matches(category)
    }

    async fn deliver(&self, notification: Arc<Notification<P>>) -> Result<(), DeliveryError> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| DeliveryError::Disconnected)
    }

    fn queue_capacity(&self) -> Option<usize> {
        self.queue_capacity
    }
}

/// Calls a synchronous callback for each accepted notification.
pub struct FnSubscriber<F, P> {
    id: SubscriberId,
    filter: CategoryFilter,
    f: F,
    _payload: PhantomData<fn(P)>,
}

impl<F, P> FnSubscriber<F, P>
where
    F: Fn(&Notification<P>) -> Result<(), DeliveryError>,
{
    pub fn new(id: impl Into<SubscriberId>, filter: CategoryFilter, f: F) -> Self {
        Self {
            id: id.into(),
            filter,
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<F, P> Subscriber<P> for FnSubscriber<F, P>
where
    F: Fn(&Notification<P>) -> Result<(), DeliveryError> + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn id(&self) -> SubscriberId {
        self.id.clone()
    }

    fn accepts(&self, category: &str) -> bool {
        self.filter.matches(category)
    }

    async fn deliver(&self, notification: Arc<Notification<P>>) -> Result<(), DeliveryError> {
        (self.f)(&notification)
    }
}
