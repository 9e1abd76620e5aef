//! Result store: write-once analysis output per completed job.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use finsight_core::{AnalysisResult, JobId};

use super::StoreError;

/// Bounds accepted by `ResultStore::list`.
pub const MIN_PAGE_LIMIT: u32 = 1;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// One page of results plus the total row count.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    pub total: u64,
    pub results: Vec<AnalysisResult>,
}

/// Analysis output persistence.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a result. `StoreError::Duplicate` if one exists for the job;
    /// this uniqueness guard is what makes redelivered completions no-ops.
    async fn put(&self, result: &AnalysisResult) -> Result<(), StoreError>;

    /// Read a result by job id.
    async fn get(&self, job_id: JobId) -> Result<Option<AnalysisResult>, StoreError>;

    /// Page through results, newest first. `limit` is clamped to
    /// `[MIN_PAGE_LIMIT, MAX_PAGE_LIMIT]`.
    async fn list(&self, limit: u32, offset: u32) -> Result<ResultPage, StoreError>;

    /// Mean `processing_time` across all results; `None` when empty.
    async fn average_processing_time(&self) -> Result<Option<f64>, StoreError>;
}

pub(crate) fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(MIN_PAGE_LIMIT, MAX_PAGE_LIMIT)
}

/// In-memory result store for tests and single-process development.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<JobId, AnalysisResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, result: &AnalysisResult) -> Result<(), StoreError> {
        let mut results = self.results.write().unwrap();
        if results.contains_key(&result.job_id) {
            return Err(StoreError::Duplicate(result.job_id));
        }
        results.insert(result.job_id, result.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<AnalysisResult>, StoreError> {
        Ok(self.results.read().unwrap().get(&job_id).cloned())
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<ResultPage, StoreError> {
        let limit = clamp_limit(limit) as usize;
        let results = self.results.read().unwrap();

        let mut all: Vec<AnalysisResult> = results.values().cloned().collect();
        // Newest first; job id (time-ordered UUIDv7) breaks created_at ties.
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.as_uuid().cmp(a.job_id.as_uuid()))
        });

        let total = all.len() as u64;
        let page = all.into_iter().skip(offset as usize).take(limit).collect();
        Ok(ResultPage {
            total,
            results: page,
        })
    }

    async fn average_processing_time(&self) -> Result<Option<f64>, StoreError> {
        let results = self.results.read().unwrap();
        if results.is_empty() {
            return Ok(None);
        }
        let sum: f64 = results.values().map(|r| r.processing_time).sum();
        Ok(Some(sum / results.len() as f64))
    }
}
