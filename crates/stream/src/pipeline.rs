//! Stage chains connected by bounded queues.
//!
//! ```text
//! input ──▶ [stage 1] ──q──▶ [stage 2] ──q──▶ … ──▶ [stage n] ──q──▶ output
//! ```
//!
//! Every stage runs as its own task. A stage closes its output queue only
//! after its input is exhausted, so closing the source drains and shuts down
//! the whole chain. With strictly one-in/one-out stages the output preserves
//! input order; stages that emit zero or many items keep their relative order
//! too, since each queue has a single producer and a single consumer.
//!
//! A stage that panics on an item produces nothing for that item. The panic
//! is reported as a `StageFailed` event and the stage moves on to the next
//! item; stages that need a downstream marker should return
//! `Result<_, StageFailure>` (see [`try_map`](crate::try_map)) instead.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use strand_core::{CancellationToken, SharedSink};

use crate::stage::{Stage, StageContext};

/// Everything a stage task needs from the run it belongs to.
#[derive(Clone)]
struct RunContext {
    capacity: usize,
    token: CancellationToken,
    sink: Option<SharedSink>,
}

type Connector<I, O> = Arc<dyn Fn(mpsc::Receiver<I>, &RunContext) -> mpsc::Receiver<O> + Send + Sync>;

/// Builds a [`Pipeline`] one stage at a time.
///
/// Each `.stage(..)` call checks at compile time that the new stage's input
/// type matches the previous stage's output type.
pub struct PipelineBuilder<I, O> {
    capacity: usize,
    sink: Option<SharedSink>,
    stages: Vec<String>,
    connect: Connector<I, O>,
}

impl<I> PipelineBuilder<I, I>
where
    I: Send + 'static,
{
    /// Start a pipeline whose inter-stage queues hold `capacity` items.
    ///
    /// A capacity of 0 is treated as 1, the tightest lockstep tokio queues
    /// allow; larger capacities let upstream stages run ahead.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sink: None,
            stages: Vec::new(),
            connect: Arc::new(|input: mpsc::Receiver<I>, _: &RunContext| input),
        }
    }
}

impl<I, O> PipelineBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Append a stage.
    pub fn stage<N, S>(self, stage: S) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        S: Stage<O, N>,
    {
        let mut stages = self.stages;
        stages.push(stage.name().to_string());

        let previous = self.connect;
        let stage = Arc::new(stage);
        let connect: Connector<I, N> = Arc::new(move |input: mpsc::Receiver<I>, run: &RunContext| {
            let upstream = previous(input, run);
            spawn_stage(stage.clone(), upstream, run)
        });

        PipelineBuilder {
            capacity: self.capacity,
            sink: self.sink,
            stages,
            connect,
        }
    }

    pub fn build(self) -> Pipeline<I, O> {
        Pipeline {
            capacity: self.capacity,
            sink: self.sink,
            stages: self.stages,
            connect: self.connect,
        }
    }
}

/// A composed chain of stages, reusable across runs.
pub struct Pipeline<I, O> {
    capacity: usize,
    sink: Option<SharedSink>,
    stages: Vec<String>,
    connect: Connector<I, O>,
}

impl<I, O> std::fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("capacity", &self.capacity)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

impl<I> Pipeline<I, I>
where
    I: Send + 'static,
{
    pub fn builder(capacity: usize) -> PipelineBuilder<I, I> {
        PipelineBuilder::new(capacity)
    }
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Stage names in execution order.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Spawn one task per stage and return the final output queue.
    ///
    /// The output closes once `input` is closed and every stage has drained.
    /// Must be called from within a tokio runtime.
    pub fn run(&self, input: mpsc::Receiver<I>) -> mpsc::Receiver<O> {
        self.run_until(input, CancellationToken::new())
    }

    /// Like [`run`](Self::run), but every stage stops promptly (closing its
    /// output) once `token` is cancelled. In-flight items may be lost.
    pub fn run_until(&self, input: mpsc::Receiver<I>, token: CancellationToken) -> mpsc::Receiver<O> {
        let run = RunContext {
            capacity: self.capacity,
            token,
            sink: self.sink.clone(),
        };
        debug!(stages = ?self.stages, capacity = self.capacity, "pipeline started");
        (self.connect)(input, &run)
    }

    /// [`run`](Self::run) exposed as a `Stream`.
    pub fn run_stream(&self, input: mpsc::Receiver<I>) -> ReceiverStream<O> {
        ReceiverStream::new(self.run(input))
    }
}

fn spawn_stage<I, O, S>(stage: Arc<S>, mut input: mpsc::Receiver<I>, run: &RunContext) -> mpsc::Receiver<O>
where
    I: Send + 'static,
    O: Send + 'static,
    S: Stage<I, O>,
{
    let (tx, rx) = mpsc::channel(run.capacity);
    let token = run.token.clone();
    let ctx = StageContext::new(stage.name(), run.sink.clone());

    tokio::spawn(async move {
        let mut processed: u64 = 0;
        let mut panicked: u64 = 0;

        'items: loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                item = input.recv() => item,
            };
            let Some(item) = item else {
                break;
            };

            // Run on its own task so a panicking stage loses one item, not
            // the rest of the stream.
            let mut task = {
                let stage = stage.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { stage.process(item, &ctx).await })
            };
            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    task.abort();
                    break;
                }
                joined = &mut task => joined,
            };
            processed += 1;

            let outputs = match joined {
                Ok(outputs) => outputs,
                Err(err) if err.is_panic() => {
                    panicked += 1;
                    ctx.fail(panic_message(err.into_panic()));
                    continue;
                }
                Err(_) => continue,
            };

            for out in outputs {
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => break 'items,
                    sent = tx.send(out) => sent,
                };
                if sent.is_err() {
                    // Downstream hung up; nothing left to feed.
                    break 'items;
                }
            }
        }

        debug!(stage = %ctx.stage(), processed, panicked, "stage finished");
        // Dropping `tx` closes this stage's output.
    });

    rx
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("stage panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("stage panicked: {s}")
    } else {
        "stage panicked".to_string()
    }
}

/// Feed a finite sequence into a new bounded queue.
///
/// The queue closes after the last item. Must be called from within a tokio
/// runtime.
pub fn from_iter<T, It>(items: It, capacity: usize) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    It: IntoIterator<Item = T>,
    It::IntoIter: Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let items = items.into_iter();
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Collect everything until the queue closes.
pub async fn drain<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
        out.push(item);
    }
    out
}
