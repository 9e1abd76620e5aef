//! Job lifecycle model and the records the pipeline persists.
//!
//! A job moves through a strict state machine:
//!
//! ```text
//! Pending -> Processing -> { Completed, Failed }
//! ```
//!
//! Terminal states never regress. `Processing -> Processing` is allowed as an
//! idempotent re-claim: a worker taking over a lease-expired delivery touches
//! the job without changing its observable status sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and enqueued, waiting for a worker.
    Pending,
    /// Claimed by a worker, analysis in flight.
    Processing,
    /// Analysis finished; a result row exists.
    Completed,
    /// Analysis failed; `error_message` says why.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown status: {other}"))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Original filename of the upload (kept for display; the stored file is
    /// named by job id).
    pub filename: String,
    /// Free-text question the analysis should answer.
    pub query: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, when the job enters a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Present iff `status == Failed`.
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(job_id: JobId, filename: impl Into<String>, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            filename: filename.into(),
            query: query.into(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    /// Move the job to `next`, enforcing the state machine.
    ///
    /// Bumps `updated_at` on every accepted move. Entering a terminal state
    /// stamps `completed_at`; entering `Failed` records `error_message`.
    pub fn transition_to(
        &mut self,
        next: JobStatus,
        error_message: Option<String>,
    ) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(format!(
                "{} -> {}",
                self.status, next
            )));
        }

        let now = Utc::now();
        self.status = next;
        self.updated_at = now;

        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if next == JobStatus::Failed {
            self.error_message =
                Some(error_message.unwrap_or_else(|| "analysis failed".to_string()));
        }

        Ok(())
    }
}

/// Completed analysis output, one-to-one with a completed job.
///
/// `filename` and `query` are duplicated from the job so a result can be
/// served without a second lookup. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub job_id: JobId,
    pub filename: String,
    pub query: String,
    pub analysis: String,
    /// Wall-clock seconds the attempt spent in the analyzer.
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(
        job_id: JobId,
        filename: impl Into<String>,
        query: impl Into<String>,
        analysis: impl Into<String>,
        processing_time: f64,
    ) -> Self {
        Self {
            job_id,
            filename: filename.into(),
            query: query.into(),
            analysis: analysis.into(),
            processing_time,
            created_at: Utc::now(),
        }
    }
}

/// One telemetry row per job attempt. Append-only, aggregate-use only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub job_id: JobId,
    pub client_origin: Option<String>,
    pub file_size: Option<i64>,
    pub query_length: i64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(
        job_id: JobId,
        client_origin: Option<String>,
        file_size: Option<i64>,
        query_length: i64,
        success: bool,
    ) -> Self {
        Self {
            job_id,
            client_origin,
            file_size,
            query_length,
            success,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn test_job() -> Job {
        Job::new(JobId::new(), "report.pdf", "summarize revenue")
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut job = test_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.completed_at.is_none());

        job.transition_to(JobStatus::Processing, None).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.completed_at.is_none());

        job.transition_to(JobStatus::Completed, None).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());
    }

    #[test]
    fn failure_records_error_message() {
        let mut job = test_job();
        job.transition_to(JobStatus::Processing, None).unwrap();
        job.transition_to(JobStatus::Failed, Some("boom".into()))
            .unwrap();
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn terminal_states_never_regress() {
        let mut job = test_job();
        job.transition_to(JobStatus::Processing, None).unwrap();
        job.transition_to(JobStatus::Completed, None).unwrap();
        let stamped = job.completed_at;

        for next in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert!(job.transition_to(next, None).is_err());
        }
        assert_eq!(job.completed_at, stamped);
    }

    #[test]
    fn cannot_complete_without_claim() {
        let mut job = test_job();
        assert!(job.transition_to(JobStatus::Completed, None).is_err());
        assert!(job.transition_to(JobStatus::Failed, None).is_err());
    }

    #[test]
    fn reclaim_is_idempotent() {
        let mut job = test_job();
        job.transition_to(JobStatus::Processing, None).unwrap();
        job.transition_to(JobStatus::Processing, None).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.completed_at.is_none());
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Processing),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
        ]
    }

    proptest! {
        /// No sequence of transition attempts can produce an observable status
        /// history other than pending -> processing -> {completed, failed}.
        #[test]
        fn only_legal_sequences_are_observable(attempts in prop::collection::vec(status_strategy(), 0..24)) {
            let mut job = test_job();
            let mut observed = vec![job.status];

            for next in attempts {
                if job.transition_to(next, Some("induced".into())).is_ok() {
                    observed.push(job.status);
                }
            }

            // Collapse idempotent re-claims; the visible sequence must be a
            // prefix of pending, processing, terminal.
            observed.dedup();
            prop_assert!(observed.len() <= 3);
            prop_assert_eq!(observed[0], JobStatus::Pending);
            if observed.len() > 1 {
                prop_assert_eq!(observed[1], JobStatus::Processing);
            }
            if observed.len() > 2 {
                prop_assert!(observed[2].is_terminal());
            }

            // Terminal bookkeeping invariants.
            prop_assert_eq!(job.completed_at.is_some(), job.status.is_terminal());
            prop_assert_eq!(job.error_message.is_some(), job.status == JobStatus::Failed);
        }
    }
}
