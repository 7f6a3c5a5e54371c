//! Bounded worker pool.
//!
//! ## Design
//!
//! - A fixed number of workers pull jobs from one shared, bounded queue
//! - Each job is processed exactly once, by exactly one worker
//! - A job's failure (error or panic) becomes a failed [`JobResult`]; it never
//!   takes down its worker or the pool
//! - No automatic retry: resubmit a failed job, or wrap the handler in a
//!   retry decorator
//!
//! ## Components
//!
//! - `Job` / `JobResult`: unit of work and its outcome
//! - `WorkerPool`: submission side, lifecycle and statistics
//! - `Results`: the single consumer end of the result queue

pub mod job;
pub mod pool;
pub mod results;

pub use job::{Job, JobFailure, JobResult};
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use results::Results;
