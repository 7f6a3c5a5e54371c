//! Streaming shapes: stage pipelines and fan-out/fan-in.
//!
//! Both are built from bounded `tokio::sync::mpsc` queues. A producer closes
//! its queue by dropping its sender; consumers drain until closed-and-empty,
//! so shutdown cascades downstream without extra signalling.

pub mod fan;
pub mod pipeline;
pub mod stage;

pub use fan::{SharedReceiver, combine, distribute, fan_out_fan_in};
pub use pipeline::{Pipeline, PipelineBuilder, drain, from_iter};
pub use stage::{
    AndThen, Filter, FlatMap, Map, MapOk, Stage, StageContext, StageFailure, Then, TryMap,
    and_then, filter, flat_map, map, map_ok, then, try_map,
};
