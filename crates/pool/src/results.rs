//! Consumer end of a pool's result queue.

use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::job::JobResult;

/// Results produced by a [`WorkerPool`](crate::WorkerPool).
///
/// There is exactly one `Results` per pool. The queue closes once every
/// worker has exited, so `recv` returning `None` means the pool is done.
///
/// ## Usage Pattern
///
/// ```ignore
/// pool.close();
/// while let Some(result) = results.recv().await {
///     match result.outcome {
///         Ok(value) => handle(value),
///         Err(failure) => resubmit_or_log(result.job_id, failure),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Results<R> {
    receiver: UnboundedReceiver<JobResult<R>>,
}

impl<R> Results<R> {
    pub(crate) fn new(receiver: UnboundedReceiver<JobResult<R>>) -> Self {
        Self { receiver }
    }

    /// Wait for the next result; `None` once all workers have exited.
    pub async fn recv(&mut self) -> Option<JobResult<R>> {
        self.receiver.recv().await
    }

    /// Take a result if one is ready.
    pub fn try_recv(&mut self) -> Result<JobResult<R>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for the next result.
    ///
    /// `None` covers both "timed out" and "pool finished"; use
    /// [`recv`](Self::recv) to tell them apart.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<JobResult<R>> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drain until the pool has finished.
    pub async fn collect(mut self) -> Vec<JobResult<R>> {
        let mut all = Vec::new();
        while let Some(result) = self.receiver.recv().await {
            all.push(result);
        }
        all
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<JobResult<R>> {
        UnboundedReceiverStream::new(self.receiver)
    }
}
