//! Cancellation signal passed alongside blocking operations.
//!
//! Components never consult a global flag; every blocking call that can be
//! aborted takes a [`CancellationToken`] (or a timeout) explicitly.

use std::future::Future;

pub use tokio_util::sync::CancellationToken;

use crate::error::{StrandError, StrandResult};

/// Drive `fut` to completion unless `token` is cancelled first.
///
/// Returns [`StrandError::Cancelled`] when the token wins. A token that is
/// already cancelled wins even if `fut` would be immediately ready.
pub async fn cancelled_or<F, T>(token: &CancellationToken, fut: F) -> StrandResult<T>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return Err(StrandError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StrandError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let out = cancelled_or(&token, async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn pre_cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let out = cancelled_or(&token, async { 7 }).await;
        assert_eq!(out, Err(StrandError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_pending_future() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let out = cancelled_or(&token, tokio::time::sleep(Duration::from_secs(3600))).await;
        assert_eq!(out, Err(StrandError::Cancelled));
    }
}
