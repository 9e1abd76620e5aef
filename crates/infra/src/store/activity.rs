//! Activity store: append-only telemetry rows.

use std::sync::Mutex;

use async_trait::async_trait;

use finsight_core::ActivityRecord;

use super::StoreError;

/// Aggregate totals over the activity log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ActivityTotals {
    pub total: u64,
    pub succeeded: u64,
}

impl ActivityTotals {
    /// Percentage of successful attempts; `None` when nothing was recorded.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.succeeded as f64 / self.total as f64 * 100.0)
    }
}

/// Append-only attempt telemetry.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn record(&self, activity: &ActivityRecord) -> Result<(), StoreError>;

    async fn totals(&self) -> Result<ActivityTotals, StoreError>;
}

/// In-memory activity store for tests and single-process development.
#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    records: Mutex<Vec<ActivityRecord>>,
}

impl InMemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, for assertions in tests.
    pub fn all(&self) -> Vec<ActivityRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn record(&self, activity: &ActivityRecord) -> Result<(), StoreError> {
        self.records.lock().unwrap().push(activity.clone());
        Ok(())
    }

    async fn totals(&self) -> Result<ActivityTotals, StoreError> {
        let records = self.records.lock().unwrap();
        Ok(ActivityTotals {
            total: records.len() as u64,
            succeeded: records.iter().filter(|r| r.success).count() as u64,
        })
    }
}
