//! Process-wide logging setup shared by binaries and integration tests.
//!
//! Library crates only emit `tracing` events; installing a subscriber is
//! left to whoever owns the process.

use serde::{Deserialize, Serialize};

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Initialize process-wide tracing with the default configuration.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    init_with(&ObservabilityConfig::default());
}

/// Initialize process-wide tracing.
///
/// `RUST_LOG` wins over `config.filter` when set. Returns `false` if a global
/// subscriber was already installed.
pub fn init_with(config: &ObservabilityConfig) -> bool {
    let filter = crate::tracing::filter_from_env(&config.filter);

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_ok()
    }
}

/// Filter construction.
pub mod tracing;
