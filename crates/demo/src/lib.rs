//! End-to-end composition of the strand components.
//!
//! ```text
//! RateLimiter ──▶ WorkerPool ──▶ CircuitBreaker ──▶ flaky service
//!                     │
//!                     ├──▶ Hub (per-job reports to subscribers)
//!                     └──▶ Pipeline ──▶ fan-out/fan-in (result post-processing)
//! ```

pub mod app;
pub mod config;
pub mod service;

pub use app::{CATEGORY_FAILED, CATEGORY_SUCCEEDED, DemoSummary, JobReport, PostProcessing, run};
pub use config::DemoConfig;
pub use service::{FlakyService, ServiceError};
