//! Infrastructure wiring for the API process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use finsight_infra::queue::{InMemoryQueue, RedisStreamsQueue, TaskQueue};
use finsight_infra::store::{
    init_schema, ActivityStore, InMemoryActivityStore, InMemoryJobStore, InMemoryResultStore,
    JobStore, PostgresActivityStore, PostgresJobStore, PostgresResultStore, ResultStore,
};

/// Handles the routes need: stores, queue, and where uploads land.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: Arc<dyn JobStore>,
    pub results: Arc<dyn ResultStore>,
    pub activity: Arc<dyn ActivityStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub upload_dir: PathBuf,
}

impl AppServices {
    /// Wire against Postgres + Redis when both are configured, otherwise run
    /// the in-memory single-process development mode.
    pub async fn from_env() -> anyhow::Result<Self> {
        let upload_dir =
            PathBuf::from(std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "data".to_string()));

        let database_url = std::env::var("DATABASE_URL").ok();
        let redis_url = std::env::var("REDIS_URL").ok();

        match (database_url, redis_url) {
            (Some(database_url), Some(redis_url)) => {
                let pool = finsight_infra::store::postgres::connect(&database_url).await?;
                init_schema(&pool).await?;

                let lease = std::env::var("QUEUE_LEASE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(660));
                let consumer = format!("api-{}", uuid::Uuid::now_v7());
                let queue = RedisStreamsQueue::connect(&redis_url, consumer, lease).await?;

                Ok(Self {
                    jobs: Arc::new(PostgresJobStore::new(pool.clone())),
                    results: Arc::new(PostgresResultStore::new(pool.clone())),
                    activity: Arc::new(PostgresActivityStore::new(pool)),
                    queue: Arc::new(queue),
                    upload_dir,
                })
            }
            _ => {
                warn!(
                    "DATABASE_URL/REDIS_URL not set; using in-memory stores and queue \
                     (single-process development mode, no separate workers)"
                );
                Ok(Self::in_memory(upload_dir))
            }
        }
    }

    /// Fully in-memory wiring, shared with tests.
    pub fn in_memory(upload_dir: PathBuf) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            results: Arc::new(InMemoryResultStore::new()),
            activity: Arc::new(InMemoryActivityStore::new()),
            queue: Arc::new(InMemoryQueue::new()),
            upload_dir,
        }
    }
}
