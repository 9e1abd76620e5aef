use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use finsight_analyzer::{AnalyzerConfig, DocumentAnalyst};
use finsight_infra::queue::RedisStreamsQueue;
use finsight_infra::store::{
    init_schema, PostgresActivityStore, PostgresJobStore, PostgresResultStore,
};
use finsight_worker::{WorkerConfig, WorkerDeps, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    finsight_observability::init();

    let config = WorkerConfig::from_env();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set; workers share state with the API through the store")?;
    let redis_url = std::env::var("REDIS_URL")
        .context("REDIS_URL must be set; workers receive jobs through the queue")?;

    let pool = finsight_infra::store::postgres::connect(&database_url).await?;
    init_schema(&pool).await?;

    // The lease must outlive the hard deadline, or a slow-but-alive attempt
    // would be handed to a second worker.
    let lease = std::env::var("QUEUE_LEASE_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(config.hard_deadline + Duration::from_secs(60));

    let consumer = format!("worker-{}", uuid::Uuid::now_v7());
    let queue = RedisStreamsQueue::connect(&redis_url, &consumer, lease).await?;

    let deps = WorkerDeps {
        jobs: Arc::new(PostgresJobStore::new(pool.clone())),
        results: Arc::new(PostgresResultStore::new(pool.clone())),
        activity: Arc::new(PostgresActivityStore::new(pool)),
        queue: Arc::new(queue),
        analyzer: Arc::new(DocumentAnalyst::new(AnalyzerConfig::from_env())),
    };

    tracing::info!(
        consumer = %consumer,
        concurrency = config.concurrency,
        "worker pool starting"
    );
    let handle = WorkerPool::spawn(deps, config);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested; draining in-flight attempts");
    handle.shutdown().await;

    Ok(())
}
