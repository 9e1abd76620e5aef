use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finsight_core::{AnalysisResult, Job, JobStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
    pub offset: Option<i64>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub filename: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for StatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            status: job.status,
            filename: job.filename,
            query: job.query,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            error: job.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultResponse {
    pub job_id: String,
    pub filename: String,
    pub query: String,
    pub analysis: String,
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
}

impl From<AnalysisResult> for ResultResponse {
    fn from(result: AnalysisResult) -> Self {
        Self {
            job_id: result.job_id.to_string(),
            filename: result.filename,
            query: result.query,
            analysis: result.analysis,
            processing_time: result.processing_time,
            created_at: result.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub total: u64,
    pub results: Vec<ResultResponse>,
}
