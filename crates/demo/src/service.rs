//! Simulated downstream dependency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service unavailable (call {call})")]
    Unavailable { call: u64 },
}

/// A remote call that fails deterministically on every `failure_every`-th
/// invocation.
#[derive(Debug)]
pub struct FlakyService {
    failure_every: u64,
    latency: Duration,
    calls: AtomicU64,
}

impl FlakyService {
    pub fn new(failure_every: u64, latency: Duration) -> Self {
        Self {
            failure_every,
            latency,
            calls: AtomicU64::new(0),
        }
    }

    pub async fn call(&self, request: u64) -> Result<u64, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failure_every > 0 && call % self.failure_every == 0 {
            return Err(ServiceError::Unavailable { call });
        }
        Ok(request * request)
    }

    /// Calls that actually reached the service.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fails_on_schedule() {
        let service = FlakyService::new(3, Duration::ZERO);
        assert_eq!(service.call(2).await, Ok(4));
        assert_eq!(service.call(3).await, Ok(9));
        assert_eq!(service.call(4).await, Err(ServiceError::Unavailable { call: 3 }));
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn zero_never_fails() {
        let service = FlakyService::new(0, Duration::ZERO);
        for n in 0..10 {
            assert!(service.call(n).await.is_ok());
        }
    }
}
