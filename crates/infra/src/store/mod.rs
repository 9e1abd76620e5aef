//! Durable stores for jobs, results, and activity telemetry.
//!
//! ## Components
//!
//! - `JobStore`: job rows and the serialized claim/transition machinery
//! - `ResultStore`: completed analysis output, write-once per job
//! - `ActivityStore`: append-only telemetry rows for aggregate statistics
//!
//! ## Ownership
//!
//! A job row has single-writer semantics per attempt: `claim` is a
//! compare-and-set on `pending -> processing`, so two copies of the same
//! dispatch message cannot both win. The result row's uniqueness constraint
//! is the idempotency guard against at-least-once redelivery.

pub mod activity;
pub mod job;
pub mod postgres;
pub mod result;

pub use activity::{ActivityStore, ActivityTotals, InMemoryActivityStore};
pub use job::{InMemoryJobStore, JobStore, StatusCounts};
pub use postgres::{
    init_schema, PostgresActivityStore, PostgresJobStore, PostgresResultStore,
};
pub use result::{InMemoryResultStore, ResultPage, ResultStore};

use finsight_core::JobId;

/// Store-level error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("already exists: {0}")]
    Duplicate(JobId),

    /// A claim lost the race: the job is no longer pending.
    #[error("claim conflict: job {0} is not pending")]
    Conflict(JobId),

    #[error("invalid transition for job {job_id}: {detail}")]
    InvalidTransition { job_id: JobId, detail: String },

    #[error("storage error: {0}")]
    Backend(String),
}
