//! The stage abstraction and its function adapters.
//!
//! A stage turns one input item into zero or more output items. Stages are
//! stateless between items unless an implementation documents otherwise.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use thiserror::Error;

use strand_core::{ComponentEvent, SharedSink};

/// A stage that failed on one item.
///
/// Fallible adapters emit this downstream in place of the item instead of
/// silently dropping it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage {stage} failed: {message}")]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Per-run information handed to a stage with every item.
#[derive(Clone)]
pub struct StageContext {
    stage: String,
    sink: Option<SharedSink>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.stage)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl StageContext {
    pub fn new(stage: impl Into<String>, sink: Option<SharedSink>) -> Self {
        Self {
            stage: stage.into(),
            sink,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Build a failure tagged with this stage and report it.
    pub fn fail(&self, message: impl Into<String>) -> StageFailure {
        let failure = StageFailure::new(self.stage.clone(), message);
        tracing::warn!(stage = %self.stage, error = %failure.message, "stage failed on item");
        if let Some(sink) = &self.sink {
            sink.record(&ComponentEvent::StageFailed {
                stage: failure.stage.clone(),
                error: failure.message.clone(),
            });
        }
        failure
    }
}

/// One step of a pipeline.
#[async_trait]
pub trait Stage<I, O>: Send + Sync + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str;

    /// Transform one item into zero or more outputs.
    async fn process(&self, item: I, ctx: &StageContext) -> Vec<O>;
}

/// One-to-one transform. See [`map`].
pub struct Map<F, I> {
    name: String,
    f: F,
    _in: PhantomData<fn(I)>,
}

/// Apply `f` to every item.
pub fn map<F, I, O>(name: impl Into<String>, f: F) -> Map<F, I>
where
    F: Fn(I) -> O,
{
    Map {
        name: name.into(),
        f,
        _in: PhantomData,
    }
}

#[async_trait]
impl<F, I, O> Stage<I, O> for Map<F, I>
where
    F: Fn(I) -> O + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: I, _ctx: &StageContext) -> Vec<O> {
        vec![(self.f)(item)]
    }
}

/// Keeps items matching a predicate. See [`filter`].
pub struct Filter<F> {
    name: String,
    pred: F,
}

pub fn filter<F, T>(name: impl Into<String>, pred: F) -> Filter<F>
where
    F: Fn(&T) -> bool,
{
    Filter {
        name: name.into(),
        pred,
    }
}

#[async_trait]
impl<F, T> Stage<T, T> for Filter<F>
where
    F: Fn(&T) -> bool + Send + Sync + 'static,
    T: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: T, _ctx: &StageContext) -> Vec<T> {
        if (self.pred)(&item) { vec![item] } else { Vec::new() }
    }
}

/// One-to-many transform. See [`flat_map`].
pub struct FlatMap<F, I> {
    name: String,
    f: F,
    _in: PhantomData<fn(I)>,
}

pub fn flat_map<F, I, It>(name: impl Into<String>, f: F) -> FlatMap<F, I>
where
    F: Fn(I) -> It,
    It: IntoIterator,
{
    FlatMap {
        name: name.into(),
        f,
        _in: PhantomData,
    }
}

#[async_trait]
impl<F, I, It> Stage<I, It::Item> for FlatMap<F, I>
where
    F: Fn(I) -> It + Send + Sync + 'static,
    It: IntoIterator,
    It::Item: Send + 'static,
    I: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: I, _ctx: &StageContext) -> Vec<It::Item> {
        (self.f)(item).into_iter().collect()
    }
}

/// Async one-to-one transform. See [`then`].
pub struct Then<F, I> {
    name: String,
    f: F,
    _in: PhantomData<fn(I)>,
}

/// Apply an async `f` to every item (e.g. a lookup against a remote service).
pub fn then<F, I, Fut>(name: impl Into<String>, f: F) -> Then<F, I>
where
    F: Fn(I) -> Fut,
    Fut: Future,
{
    Then {
        name: name.into(),
        f,
        _in: PhantomData,
    }
}

#[async_trait]
impl<F, I, Fut> Stage<I, Fut::Output> for Then<F, I>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
    I: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: I, _ctx: &StageContext) -> Vec<Fut::Output> {
        vec![(self.f)(item).await]
    }
}

/// Fallible transform that tags failures. See [`try_map`].
pub struct TryMap<F, I> {
    name: String,
    f: F,
    _in: PhantomData<fn(I)>,
}

/// Apply a fallible `f`; an `Err` travels downstream as a [`StageFailure`].
pub fn try_map<F, I, O, E>(name: impl Into<String>, f: F) -> TryMap<F, I>
where
    F: Fn(I) -> Result<O, E>,
    E: std::fmt::Display,
{
    TryMap {
        name: name.into(),
        f,
        _in: PhantomData,
    }
}

#[async_trait]
impl<F, I, O, E> Stage<I, Result<O, StageFailure>> for TryMap<F, I>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: std::fmt::Display,
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: I, ctx: &StageContext) -> Vec<Result<O, StageFailure>> {
        vec![(self.f)(item).map_err(|e| ctx.fail(e.to_string()))]
    }
}

/// Infallible transform over successful items. See [`map_ok`].
pub struct MapOk<F, T> {
    name: String,
    f: F,
    _in: PhantomData<fn(T)>,
}

/// Apply `f` to `Ok` items; failures pass through untouched.
pub fn map_ok<F, T, U>(name: impl Into<String>, f: F) -> MapOk<F, T>
where
    F: Fn(T) -> U,
{
    MapOk {
        name: name.into(),
        f,
        _in: PhantomData,
    }
}

#[async_trait]
impl<F, T, U> Stage<Result<T, StageFailure>, Result<U, StageFailure>> for MapOk<F, T>
where
    F: Fn(T) -> U + Send + Sync + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        item: Result<T, StageFailure>,
        _ctx: &StageContext,
    ) -> Vec<Result<U, StageFailure>> {
        vec![item.map(&self.f)]
    }
}

/// Fallible transform over successful items. See [`and_then`].
pub struct AndThen<F, T> {
    name: String,
    f: F,
    _in: PhantomData<fn(T)>,
}

/// Apply a fallible `f` to `Ok` items; earlier failures pass through and new
/// ones are tagged with this stage.
pub fn and_then<F, T, U, E>(name: impl Into<String>, f: F) -> AndThen<F, T>
where
    F: Fn(T) -> Result<U, E>,
    E: std::fmt::Display,
{
    AndThen {
        name: name.into(),
        f,
        _in: PhantomData,
    }
}

#[async_trait]
impl<F, T, U, E> Stage<Result<T, StageFailure>, Result<U, StageFailure>> for AndThen<F, T>
where
    F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    E: std::fmt::Display,
    T: Send + 'static,
    U: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        item: Result<T, StageFailure>,
        ctx: &StageContext,
    ) -> Vec<Result<U, StageFailure>> {
        vec![item.and_then(|v| (self.f)(v).map_err(|e| ctx.fail(e.to_string())))]
    }
}
