//! Publish/subscribe hub.
//!
//! This crate provides the **hub pattern**: producers publish notifications
//! once, and the hub fans each one out to every registered subscriber whose
//! filter accepts its category.
//!
//! ## Delivery Semantics
//!
//! - **Best-effort, non-blocking**: each subscriber has a bounded private
//!   queue; when it is full the delivery is dropped and counted, never retried
//! - **Isolation**: a slow or failing subscriber never delays the publisher or
//!   any other subscriber
//! - **Publish-time fan-out**: a notification reaches the subscribers
//!   registered when `publish` runs; later subscribers never see it
//! - **Per-subscriber order**: one subscriber sees notifications in publish
//!   order; nothing is promised across subscribers

pub mod hub;
pub mod notification;
pub mod subscriber;

pub use hub::{Hub, HubConfig, PublishReport, ShutdownReport, SubscriberStats, SubscriptionHandle};
pub use notification::{CategoryFilter, Notification, Priority};
pub use subscriber::{ChannelSubscriber, DeliveryError, FnSubscriber, Subscriber, SubscriberState};
