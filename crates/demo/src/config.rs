//! Demo configuration from `STRAND_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strand_core::{StrandError, StrandResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub jobs: u64,
    pub rate_burst: u32,
    pub rate_per_sec: f64,
    pub breaker_failures: u32,
    pub breaker_timeout_ms: u64,
    /// Every n-th service call fails (0 = never)
    pub failure_every: u64,
    pub log_json: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 16,
            jobs: 40,
            rate_burst: 10,
            rate_per_sec: 50.0,
            breaker_failures: 3,
            breaker_timeout_ms: 200,
            failure_every: 4,
            log_json: true,
        }
    }
}

impl DemoConfig {
    /// Read the process environment; unset variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment, a map in tests, ...).
    ///
    /// Values that fail to parse are logged and replaced by the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            workers: parse_or(&lookup, "STRAND_WORKERS", d.workers),
            queue_capacity: parse_or(&lookup, "STRAND_QUEUE_CAPACITY", d.queue_capacity),
            jobs: parse_or(&lookup, "STRAND_JOBS", d.jobs),
            rate_burst: parse_or(&lookup, "STRAND_RATE_BURST", d.rate_burst),
            rate_per_sec: parse_or(&lookup, "STRAND_RATE_PER_SEC", d.rate_per_sec),
            breaker_failures: parse_or(&lookup, "STRAND_BREAKER_FAILURES", d.breaker_failures),
            breaker_timeout_ms: parse_or(&lookup, "STRAND_BREAKER_TIMEOUT_MS", d.breaker_timeout_ms),
            failure_every: parse_or(&lookup, "STRAND_FAILURE_EVERY", d.failure_every),
            log_json: parse_or(&lookup, "STRAND_LOG_JSON", d.log_json),
        }
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_timeout_ms)
    }

    pub fn validate(&self) -> StrandResult<()> {
        if self.workers == 0 {
            return Err(StrandError::invalid_config("STRAND_WORKERS must be >= 1"));
        }
        if self.rate_burst == 0 {
            return Err(StrandError::invalid_config("STRAND_RATE_BURST must be >= 1"));
        }
        // A limiter that never refills would stall the run after the burst.
        if !(self.rate_per_sec > 0.0 && self.rate_per_sec.is_finite()) {
            return Err(StrandError::invalid_config("STRAND_RATE_PER_SEC must be > 0"));
        }
        if self.breaker_failures == 0 {
            return Err(StrandError::invalid_config("STRAND_BREAKER_FAILURES must be >= 1"));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, ?default, "unparsable value; using default");
            default
        }),
    }
}
