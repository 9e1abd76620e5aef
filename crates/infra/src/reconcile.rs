//! Reconciliation sweep for the one allowed non-atomic window.
//!
//! A worker writes the result row and then marks the job completed. If it
//! dies between the two, the result exists but the job still reads
//! `processing`. This sweep finds such jobs and repairs the status; jobs that
//! are merely slow (no result yet) are left for queue redelivery.

use std::time::Duration;

use tracing::{info, warn};

use finsight_core::JobStatus;

use crate::store::{JobStore, ResultStore, StoreError};

/// Mark stale `processing` jobs completed where a result row already exists.
/// Returns the number of repaired jobs.
pub async fn repair_completed_jobs(
    jobs: &dyn JobStore,
    results: &dyn ResultStore,
    older_than: Duration,
) -> Result<u32, StoreError> {
    let mut repaired = 0;

    for job in jobs.stale_processing(older_than).await? {
        if results.get(job.job_id).await?.is_none() {
            continue;
        }

        match jobs
            .transition(job.job_id, JobStatus::Completed, None)
            .await
        {
            Ok(_) => {
                info!(job_id = %job.job_id, "repaired job with orphaned result");
                repaired += 1;
            }
            // Someone else (a redelivered attempt) got there first.
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "failed to repair job");
                return Err(e);
            }
        }
    }

    Ok(repaired)
}
