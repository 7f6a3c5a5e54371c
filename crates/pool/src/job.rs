//! Job and result types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strand_core::JobId;

/// A unit of work: an opaque payload plus its identifier.
///
/// Owned by the submitter until the pool accepts it, then by exactly one
/// worker until it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<P> {
    /// Unique job ID
    pub id: JobId,
    /// Caller-defined payload
    pub payload: P,
    /// When the job was handed to the pool
    pub submitted_at: DateTime<Utc>,
}

impl<P> Job<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: JobId::new(),
            payload,
            submitted_at: Utc::now(),
        }
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    /// The handler panicked instead of returning an error.
    pub panicked: bool,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
        }
    }

    /// Build a failure from any displayable error.
    pub fn from_error(err: impl std::fmt::Display) -> Self {
        Self::new(err.to_string())
    }

    pub(crate) fn panic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: true,
        }
    }
}

/// Outcome of one job, produced by exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult<R> {
    pub job_id: JobId,
    /// Index of the worker that ran the job
    pub worker: usize,
    /// Wall time spent in the handler
    pub elapsed: Duration,
    pub outcome: Result<R, JobFailure>,
}

impl<R> JobResult<R> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_outcome(self) -> Result<R, JobFailure> {
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_gets_fresh_id() {
        let a = Job::new(1u32);
        let b = Job::new(1u32);
        assert_ne!(a.id, b.id);
        assert_eq!(a.into_payload(), 1);
    }

    #[test]
    fn failure_from_error_keeps_message() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let failure = JobFailure::from_error(err);
        assert_eq!(failure.to_string(), "disk on fire");
        assert!(!failure.panicked);
    }

    #[test]
    fn result_reports_success() {
        let ok: JobResult<u8> = JobResult {
            job_id: JobId::new(),
            worker: 0,
            elapsed: Duration::ZERO,
            outcome: Ok(3),
        };
        assert!(ok.is_success());

        let failed: JobResult<u8> = JobResult {
            outcome: Err(JobFailure::new("nope")),
            ..ok
        };
        assert!(!failed.is_success());
    }
}
