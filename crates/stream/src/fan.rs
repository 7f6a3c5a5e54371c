//! Fan-out (work distribution) and fan-in (merge) combinators.
//!
//! ```text
//!                  ┌─▶ consumer 0 ─┐
//! input ── shared ─┼─▶ consumer 1 ─┼──▶ combine ──▶ output
//!                  └─▶ consumer 2 ─┘
//! ```
//!
//! Distribution is not broadcast: every item goes to exactly one consumer.
//! The combined output closes only after every input has closed, and every
//! producer closes its output on exit (including panics, via drop), so the
//! join can never wait on a dead producer.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, warn};

use strand_core::{StrandError, StrandResult};

/// One of several consumer handles pulling from the same queue.
///
/// Items are handed out first come, first served; each item is received by
/// exactly one handle.
pub struct SharedReceiver<T> {
    index: usize,
    inner: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

impl<T> std::fmt::Debug for SharedReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedReceiver")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl<T> SharedReceiver<T> {
    /// Position of this handle in the vector returned by [`distribute`].
    pub fn index(&self) -> usize {
        self.index
    }

    /// Next item, or `None` once the shared input is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }
}

/// Split one input across `n` consumer handles (work distribution).
pub fn distribute<T>(input: mpsc::Receiver<T>, n: usize) -> StrandResult<Vec<SharedReceiver<T>>> {
    if n == 0 {
        return Err(StrandError::invalid_config("distribute needs at least one consumer"));
    }
    let inner = Arc::new(AsyncMutex::new(input));
    Ok((0..n)
        .map(|index| SharedReceiver {
            index,
            inner: inner.clone(),
        })
        .collect())
}

/// Merge several inputs into one output.
///
/// Items from the same input keep their relative order; nothing is promised
/// across inputs. The output closes exactly once, after the last input closes
/// and drains. Must be called from within a tokio runtime.
pub fn combine<T>(inputs: Vec<mpsc::Receiver<T>>, capacity: usize) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let total = inputs.len();

    for (index, mut input) in inputs.into_iter().enumerate() {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            debug!(input = index, total, "combine input drained");
        });
    }

    // Each forwarder holds one sender; the output closes when the last one
    // is dropped.
    drop(tx);
    rx
}

/// Distribute `input` over `n` workers running `transform`, then combine
/// their outputs.
///
/// Every input item is transformed exactly once. If a worker panics, the
/// item it was holding is lost, the remaining workers keep draining the
/// input, and the output still closes.
pub fn fan_out_fan_in<T, U, F, Fut>(
    input: mpsc::Receiver<T>,
    n: usize,
    capacity: usize,
    transform: F,
) -> StrandResult<mpsc::Receiver<U>>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = U> + Send + 'static,
{
    let consumers = distribute(input, n)?;
    let transform = Arc::new(transform);
    let mut outputs = Vec::with_capacity(n);

    for consumer in consumers {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        outputs.push(rx);
        let transform = transform.clone();

        tokio::spawn(async move {
            let mut handled: u64 = 0;
            while let Some(item) = consumer.recv().await {
                let out = transform(item).await;
                handled += 1;
                if tx.send(out).await.is_err() {
                    warn!(worker = consumer.index(), "fan-in output dropped; worker exiting");
                    break;
                }
            }
            debug!(worker = consumer.index(), handled, "fan-out worker finished");
        });
    }

    Ok(combine(outputs, capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{drain, from_iter};
    use std::collections::HashSet;

    use proptest::prelude::*;

    #[tokio::test]
    async fn distribute_delivers_each_item_once() {
        let consumers = distribute(from_iter(0..100u32, 8), 4).unwrap();
        assert_eq!(consumers.len(), 4);

        let mut handles = Vec::new();
        for consumer in consumers {
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(item) = consumer.recv().await {
                    got.push(item);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn distribute_rejects_zero_consumers() {
        let err = distribute(from_iter(0..1u8, 1), 0).unwrap_err();
        assert!(matches!(err, StrandError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn combine_preserves_per_input_order() {
        let a = from_iter(vec![1, 2, 3], 1);
        let b = from_iter(vec![10, 20, 30], 1);
        let out = drain(combine(vec![a, b], 2)).await;

        assert_eq!(out.len(), 6);
        let from_a: Vec<_> = out.iter().copied().filter(|n| *n < 10).collect();
        let from_b: Vec<_> = out.iter().copied().filter(|n| *n >= 10).collect();
        assert_eq!(from_a, vec![1, 2, 3]);
        assert_eq!(from_b, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn combine_of_nothing_closes_immediately() {
        let out = drain(combine(Vec::<mpsc::Receiver<u8>>::new(), 1)).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn combine_waits_for_every_input() {
        let (slow_tx, slow_rx) = mpsc::channel(1);
        let fast = from_iter(vec![1u8], 1);
        let mut out = combine(vec![fast, slow_rx], 1);

        assert_eq!(out.recv().await, Some(1));
        // Still open: the slow input has not closed yet.
        assert!(out.try_recv().is_err());
        slow_tx.send(2).await.unwrap();
        drop(slow_tx);
        assert_eq!(out.recv().await, Some(2));
        assert_eq!(out.recv().await, None);
    }

    #[tokio::test]
    async fn panicking_worker_does_not_deadlock_fan_in() {
        let out = fan_out_fan_in(from_iter(0..20u32, 4), 3, 4, |n: u32| async move {
            if n == 7 {
                panic!("worker died on {n}");
            }
            n
        })
        .unwrap();

        let got = drain(out).await;
        assert_eq!(got.len(), 19);
        assert!(!got.contains(&7));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 48,
            ..ProptestConfig::default()
        })]

        /// Property: distributing M items over N workers and combining the
        /// results yields exactly the transform of each item once.
        #[test]
        fn fan_out_fan_in_is_exactly_once(
            items in prop::collection::hash_set(0u32..10_000, 0..200),
            workers in 1usize..8,
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            let expected: HashSet<u64> = items.iter().map(|n| u64::from(*n) * 3).collect();
            let got = rt.block_on(async move {
                let out = fan_out_fan_in(
                    from_iter(items, 4),
                    workers,
                    2,
                    |n: u32| async move { u64::from(n) * 3 },
                )
                .unwrap();
                drain(out).await
            });

            prop_assert_eq!(got.len(), expected.len());
            prop_assert_eq!(got.into_iter().collect::<HashSet<_>>(), expected);
        }
    }
}
