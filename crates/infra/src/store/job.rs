//! Job store: durable job rows plus the claim/transition state machinery.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use finsight_core::{Job, JobId, JobStatus};

use super::StoreError;

/// Per-status job totals, for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Job row persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job. `StoreError::Duplicate` if the id exists.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Read a job by id.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically move `pending -> processing` and return the claimed job.
    ///
    /// The compare-and-set is serialized per job id: of any number of
    /// concurrent claims, exactly one succeeds; the rest see
    /// `StoreError::Conflict`.
    async fn claim(&self, job_id: JobId) -> Result<Job, StoreError>;

    /// Apply a status transition, enforcing the job state machine.
    ///
    /// Bumps `updated_at`; stamps `completed_at` and `error_message` when
    /// entering a terminal state. `processing -> processing` is an idempotent
    /// re-claim touch.
    async fn transition(
        &self,
        job_id: JobId,
        next: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, StoreError>;

    /// Remove a job row.
    ///
    /// Submission-path compensation only: a job whose dispatch message never
    /// reached the queue was never submitted. Deleting an absent id is a
    /// no-op.
    async fn delete(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Per-status totals.
    async fn counts(&self) -> Result<StatusCounts, StoreError>;

    /// Jobs stuck in `processing` whose last touch is older than `older_than`.
    /// Feed for the reconciliation sweep.
    async fn stale_processing(&self, older_than: Duration) -> Result<Vec<Job>, StoreError>;
}

/// In-memory job store for tests and single-process development.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Duplicate(job.job_id));
        }
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn claim(&self, job_id: JobId) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Pending {
            return Err(StoreError::Conflict(job_id));
        }
        job.transition_to(JobStatus::Processing, None)
            .map_err(|e| StoreError::InvalidTransition {
                job_id,
                detail: e.to_string(),
            })?;
        Ok(job.clone())
    }

    async fn transition(
        &self,
        job_id: JobId,
        next: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.transition_to(next, error_message)
            .map_err(|e| StoreError::InvalidTransition {
                job_id,
                detail: e.to_string(),
            })?;
        Ok(job.clone())
    }

    async fn delete(&self, job_id: JobId) -> Result<(), StoreError> {
        self.jobs.write().unwrap().remove(&job_id);
        Ok(())
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            counts.bump(job.status);
        }
        Ok(counts)
    }

    async fn stale_processing(&self, older_than: Duration) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let jobs = self.jobs.read().unwrap();
        let mut stale: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at <= cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale)
    }
}
