//! `strand-core`: shared building blocks for the concurrency components.
//!
//! This crate holds the conventions every component agrees on: the error
//! taxonomy, identifiers, the cancellation signal and the observability
//! callback seam. It contains no runtime of its own.

pub mod cancel;
pub mod error;
pub mod hooks;
pub mod id;

pub use cancel::{CancellationToken, cancelled_or};
pub use error::{StrandError, StrandResult};
pub use hooks::{ComponentEvent, EventSink, NoopSink, RecordingSink, SharedSink, TracingSink};
pub use id::{JobId, NotificationId, SubscriberId};
