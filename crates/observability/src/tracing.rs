//! Filter construction.

use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to `default_directive`, then `info`.
pub fn filter_from_env(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
