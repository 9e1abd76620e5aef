//! Executor pool: dequeue, claim, analyze, write back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use finsight_analyzer::{Analyzer, AnalyzerError};
use finsight_core::{ActivityRecord, AnalysisResult, DispatchMessage, JobId, JobStatus};
use finsight_infra::queue::{Delivery, TaskQueue};
use finsight_infra::reconcile::repair_completed_jobs;
use finsight_infra::store::{ActivityStore, JobStore, ResultStore, StoreError};

use crate::config::WorkerConfig;

/// Everything an executor needs, shared across the pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub jobs: Arc<dyn JobStore>,
    pub results: Arc<dyn ResultStore>,
    pub activity: Arc<dyn ActivityStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub analyzer: Arc<dyn Analyzer>,
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    join: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every executor to stop.
    ///
    /// Executors finish their in-flight attempt first; nothing is abandoned
    /// mid-write.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.join {
            let _ = handle.await;
        }
    }
}

/// The analysis worker pool.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` executors plus the reconciliation task.
    pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut join = Vec::new();
        for index in 0..config.concurrency.max(1) {
            join.push(tokio::spawn(executor_loop(
                index,
                deps.clone(),
                config.clone(),
                shutdown_rx.clone(),
            )));
        }
        join.push(tokio::spawn(reconcile_loop(
            deps.clone(),
            config.clone(),
            shutdown_rx,
        )));

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn executor_loop(
    index: usize,
    deps: WorkerDeps,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(executor = index, "executor started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            dequeued = deps.queue.dequeue(config.dequeue_wait) => match dequeued {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(executor = index, error = %e, "dequeue failed");
                    tokio::time::sleep(config.dequeue_wait).await;
                    continue;
                }
            },
        };

        if let Err(e) = handle_delivery(&deps, &config, &delivery).await {
            // Storage trouble: leave the delivery unacknowledged so the queue
            // hands it out again after the lease.
            error!(
                executor = index,
                job_id = %delivery.message.job_id,
                error = %e,
                "delivery handling failed; leaving for redelivery"
            );
        }
    }

    info!(executor = index, "executor stopped");
}

/// Route one delivery: discard duplicates, take over expired leases, or
/// claim and execute.
async fn handle_delivery(
    deps: &WorkerDeps,
    config: &WorkerConfig,
    delivery: &Delivery,
) -> Result<(), StoreError> {
    let msg = &delivery.message;

    match deps.jobs.get(msg.job_id).await? {
        None => {
            // The submission was compensated away after enqueue; nothing to do.
            warn!(job_id = %msg.job_id, "job row missing; dropping message");
            ack(deps, delivery).await;
        }
        Some(job) if job.status.is_terminal() => {
            // A prior attempt already resolved this job; the redelivered copy
            // is a no-op. Clear any upload that attempt left behind.
            debug!(job_id = %msg.job_id, status = %job.status, "job already terminal; discarding");
            remove_file_if_exists(Path::new(&msg.file_path));
            ack(deps, delivery).await;
        }
        Some(job) if job.status == JobStatus::Processing => {
            if delivery.redeliveries > 0 {
                // The previous holder's lease lapsed (likely a crash); take
                // the attempt over.
                info!(job_id = %msg.job_id, redeliveries = delivery.redeliveries, "taking over expired attempt");
                match deps
                    .jobs
                    .transition(msg.job_id, JobStatus::Processing, None)
                    .await
                {
                    Ok(_) => run_attempt(deps, config, delivery).await,
                    // The job reached a terminal state under us; the takeover
                    // is moot.
                    Err(StoreError::InvalidTransition { .. }) => {
                        ack(deps, delivery).await;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                // First delivery of a duplicate: another executor holds the
                // claim and is mid-attempt.
                debug!(job_id = %msg.job_id, "claim already held; discarding duplicate");
                ack(deps, delivery).await;
            }
        }
        Some(_) => match deps.jobs.claim(msg.job_id).await {
            Ok(_) => run_attempt(deps, config, delivery).await,
            Err(StoreError::Conflict(_)) => {
                debug!(job_id = %msg.job_id, "lost claim race; discarding");
                ack(deps, delivery).await;
            }
            Err(e) => return Err(e),
        },
    }

    Ok(())
}

/// One claimed execution attempt. Resolves the job to a terminal state,
/// records activity, deletes the upload, and acknowledges the delivery.
async fn run_attempt(deps: &WorkerDeps, config: &WorkerConfig, delivery: &Delivery) {
    let msg = &delivery.message;
    let path = PathBuf::from(&msg.file_path);
    // Deleted when the attempt resolves, on every exit path.
    let _upload = UploadGuard::new(path.clone());

    let started = Instant::now();
    let verdict = run_with_deadlines(deps.analyzer.as_ref(), config, &path, &msg.query, msg.job_id).await;

    match verdict {
        Some(Ok(analysis)) => {
            let processing_time = started.elapsed().as_secs_f64();
            finish_success(deps, msg, analysis, processing_time).await;
        }
        Some(Err(e)) => {
            finish_failure(deps, msg, e.to_string()).await;
        }
        None => {
            let message = format!(
                "analysis timed out after {}s",
                config.hard_deadline.as_secs()
            );
            warn!(job_id = %msg.job_id, "{message}");
            finish_failure(deps, msg, message).await;
        }
    }

    ack(deps, delivery).await;
}

/// Drive the analyzer under the soft and hard deadlines. `None` means the
/// hard deadline fired and the attempt was abandoned.
async fn run_with_deadlines(
    analyzer: &dyn Analyzer,
    config: &WorkerConfig,
    path: &Path,
    query: &str,
    job_id: JobId,
) -> Option<Result<String, AnalyzerError>> {
    let mut attempt = Box::pin(analyzer.execute(path, query));

    let soft = config.soft_deadline.min(config.hard_deadline);
    match timeout(soft, attempt.as_mut()).await {
        Ok(result) => Some(result),
        Err(_) => {
            warn!(
                job_id = %job_id,
                soft_deadline_secs = soft.as_secs(),
                "soft deadline exceeded; analysis still running"
            );
            let remaining = config.hard_deadline.saturating_sub(soft);
            timeout(remaining, attempt.as_mut()).await.ok()
        }
    }
}

async fn finish_success(
    deps: &WorkerDeps,
    msg: &DispatchMessage,
    analysis: String,
    processing_time: f64,
) {
    let result = AnalysisResult::new(
        msg.job_id,
        &msg.filename,
        &msg.query,
        analysis,
        processing_time,
    );

    match deps.results.put(&result).await {
        Ok(()) => {
            // Result row and completion are one logical unit. If the
            // transition is lost here, the reconciliation sweep repairs it.
            if let Err(e) = deps
                .jobs
                .transition(msg.job_id, JobStatus::Completed, None)
                .await
            {
                warn!(
                    job_id = %msg.job_id,
                    error = %e,
                    "result stored but completion not recorded; reconciliation will repair"
                );
            }
            record_activity(deps, msg, true).await;
            info!(job_id = %msg.job_id, processing_time, "analysis completed");
        }
        Err(StoreError::Duplicate(_)) => {
            // A redelivered attempt raced a finished one: keep the original
            // result and record nothing new.
            debug!(job_id = %msg.job_id, "result already stored; duplicate completion discarded");
            let _ = deps
                .jobs
                .transition(msg.job_id, JobStatus::Completed, None)
                .await;
        }
        Err(e) => {
            error!(job_id = %msg.job_id, error = %e, "failed to store analysis result");
            finish_failure(deps, msg, format!("failed to store analysis result: {e}")).await;
        }
    }
}

async fn finish_failure(deps: &WorkerDeps, msg: &DispatchMessage, message: String) {
    if let Err(e) = deps
        .jobs
        .transition(msg.job_id, JobStatus::Failed, Some(message.clone()))
        .await
    {
        warn!(job_id = %msg.job_id, error = %e, "failed to record job failure");
    }
    record_activity(deps, msg, false).await;
}

async fn record_activity(deps: &WorkerDeps, msg: &DispatchMessage, success: bool) {
    let record = ActivityRecord::new(
        msg.job_id,
        msg.client_origin.clone(),
        msg.file_size,
        msg.query.len() as i64,
        success,
    );
    if let Err(e) = deps.activity.record(&record).await {
        warn!(job_id = %msg.job_id, error = %e, "failed to record activity");
    }
}

async fn ack(deps: &WorkerDeps, delivery: &Delivery) {
    if let Err(e) = deps.queue.ack(delivery).await {
        // A lost ack only means one extra redelivery, which the terminal
        // guard discards.
        warn!(job_id = %delivery.message.job_id, error = %e, "ack failed");
    }
}

async fn reconcile_loop(deps: WorkerDeps, config: WorkerConfig, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(config.reconcile_interval) => {}
        }
        if *shutdown.borrow() {
            break;
        }

        match repair_completed_jobs(
            deps.jobs.as_ref(),
            deps.results.as_ref(),
            config.reconcile_after,
        )
        .await
        {
            Ok(0) => {}
            Ok(repaired) => info!(repaired, "reconciliation repaired jobs"),
            Err(e) => warn!(error = %e, "reconciliation sweep failed"),
        }
    }
}

/// Deletes the upload when dropped. Deletion is idempotent: a file another
/// resolution already removed is not an error.
struct UploadGuard {
    path: PathBuf,
}

impl UploadGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        remove_file_if_exists(&self.path);
    }
}

fn remove_file_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete upload"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use finsight_core::Job;
    use finsight_infra::queue::InMemoryQueue;
    use finsight_infra::store::{InMemoryActivityStore, InMemoryJobStore, InMemoryResultStore};

    use super::*;

    const STUB_REPORT: &str = "stub analysis report";

    /// Fixed-output analyzer with a short, deterministic runtime.
    struct StubAnalyzer {
        executions: AtomicUsize,
    }

    impl StubAnalyzer {
        fn new() -> Self {
            Self {
                executions: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn execute(&self, _file_path: &Path, _query: &str) -> Result<String, AnalyzerError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(STUB_REPORT.to_string())
        }
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl Analyzer for FailingAnalyzer {
        async fn execute(&self, _file_path: &Path, _query: &str) -> Result<String, AnalyzerError> {
            Err(AnalyzerError::Analysis("model blew up".into()))
        }
    }

    struct SleepyAnalyzer;

    #[async_trait]
    impl Analyzer for SleepyAnalyzer {
        async fn execute(&self, _file_path: &Path, _query: &str) -> Result<String, AnalyzerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    struct Fixture {
        deps: WorkerDeps,
        jobs: Arc<InMemoryJobStore>,
        results: Arc<InMemoryResultStore>,
        activity: Arc<InMemoryActivityStore>,
        queue: Arc<InMemoryQueue>,
        _dir: tempfile::TempDir,
        dir_path: PathBuf,
    }

    fn fixture(analyzer: Arc<dyn Analyzer>, queue: Arc<InMemoryQueue>) -> Fixture {
        let jobs = Arc::new(InMemoryJobStore::new());
        let results = Arc::new(InMemoryResultStore::new());
        let activity = Arc::new(InMemoryActivityStore::new());
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();

        Fixture {
            deps: WorkerDeps {
                jobs: jobs.clone(),
                results: results.clone(),
                activity: activity.clone(),
                queue: queue.clone(),
                analyzer,
            },
            jobs,
            results,
            activity,
            queue,
            _dir: dir,
            dir_path,
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 1,
            soft_deadline: Duration::from_secs(30),
            hard_deadline: Duration::from_secs(60),
            dequeue_wait: Duration::from_millis(20),
            reconcile_interval: Duration::from_secs(3600),
            reconcile_after: Duration::from_secs(3600),
        }
    }

    /// Create the job row, write the upload, and return the message a
    /// submission would have enqueued.
    async fn submit(fx: &Fixture, body: &[u8], query: &str) -> DispatchMessage {
        let job = Job::new(JobId::new(), "report.txt", query);
        fx.jobs.create(&job).await.unwrap();

        let file_path = fx.dir_path.join(format!("{}.txt", job.job_id));
        std::fs::write(&file_path, body).unwrap();

        DispatchMessage::new(job.job_id, file_path.to_str().unwrap(), query, "report.txt")
            .with_file_size(body.len() as i64)
    }

    async fn wait_for_terminal(jobs: &dyn JobStore, job_id: JobId) -> Job {
        for _ in 0..200 {
            let job = jobs.get(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn completes_job_end_to_end() {
        let queue = Arc::new(InMemoryQueue::new());
        let fx = fixture(Arc::new(StubAnalyzer::new()), queue);
        let msg = submit(&fx, b"ten bytes!", "test").await;
        fx.queue.enqueue(&msg).await.unwrap();

        let handle = WorkerPool::spawn(fx.deps.clone(), fast_config());
        let job = wait_for_terminal(fx.jobs.as_ref(), msg.job_id).await;
        handle.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());

        // Result exists iff the job completed, with the analyzer's output.
        let result = fx.results.get(msg.job_id).await.unwrap().unwrap();
        assert_eq!(result.analysis, STUB_REPORT);
        assert!(result.processing_time > 0.0);

        // Upload is gone, one successful activity row recorded.
        assert!(!Path::new(&msg.file_path).exists());
        let activity = fx.activity.all();
        assert_eq!(activity.len(), 1);
        assert!(activity[0].success);
        assert_eq!(activity[0].file_size, Some(10));
    }

    #[tokio::test]
    async fn analyzer_failure_marks_job_failed() {
        let queue = Arc::new(InMemoryQueue::new());
        let fx = fixture(Arc::new(FailingAnalyzer), queue);
        let msg = submit(&fx, b"body", "test").await;
        fx.queue.enqueue(&msg).await.unwrap();

        let handle = WorkerPool::spawn(fx.deps.clone(), fast_config());
        let job = wait_for_terminal(fx.jobs.as_ref(), msg.job_id).await;
        handle.shutdown().await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.as_deref().unwrap().contains("model blew up"));

        // No result row for a failed job; the upload is still cleaned up.
        assert!(fx.results.get(msg.job_id).await.unwrap().is_none());
        assert!(!Path::new(&msg.file_path).exists());
        let activity = fx.activity.all();
        assert_eq!(activity.len(), 1);
        assert!(!activity[0].success);
    }

    #[tokio::test]
    async fn hard_deadline_produces_timeout_failure() {
        let queue = Arc::new(InMemoryQueue::new());
        let fx = fixture(Arc::new(SleepyAnalyzer), queue);
        let msg = submit(&fx, b"body", "test").await;
        fx.queue.enqueue(&msg).await.unwrap();

        let config = WorkerConfig {
            soft_deadline: Duration::from_millis(50),
            hard_deadline: Duration::from_millis(120),
            ..fast_config()
        };
        let handle = WorkerPool::spawn(fx.deps.clone(), config);
        let job = wait_for_terminal(fx.jobs.as_ref(), msg.job_id).await;
        handle.shutdown().await;

        assert_eq!(job.status, JobStatus::Failed);
        // Operators can tell a timeout from an analyzer runtime error.
        assert!(job.error_message.as_deref().unwrap().contains("timed out"));
        assert!(!Path::new(&msg.file_path).exists());
    }

    #[tokio::test]
    async fn redelivery_after_completion_is_a_noop() {
        let queue = Arc::new(InMemoryQueue::new());
        let fx = fixture(Arc::new(StubAnalyzer::new()), queue);
        let msg = submit(&fx, b"body", "test").await;
        fx.queue.enqueue(&msg).await.unwrap();

        let handle = WorkerPool::spawn(fx.deps.clone(), fast_config());
        let job = wait_for_terminal(fx.jobs.as_ref(), msg.job_id).await;
        let result = fx.results.get(msg.job_id).await.unwrap().unwrap();

        // The same message arrives again after the job finished.
        fx.queue.enqueue(&msg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        let after = fx.jobs.get(msg.job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        assert_eq!(after.completed_at, job.completed_at);
        assert_eq!(fx.results.get(msg.job_id).await.unwrap().unwrap(), result);

        // Exactly one success row; the duplicate recorded nothing.
        let successes = fx.activity.all().iter().filter(|a| a.success).count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_executes_once() {
        let queue = Arc::new(InMemoryQueue::new());
        let analyzer = Arc::new(StubAnalyzer::new());
        let fx = fixture(analyzer.clone(), queue);
        let msg = submit(&fx, b"body", "test").await;

        // Two copies of the same message race two executors.
        fx.queue.enqueue(&msg).await.unwrap();
        fx.queue.enqueue(&msg).await.unwrap();

        let config = WorkerConfig {
            concurrency: 2,
            ..fast_config()
        };
        let handle = WorkerPool::spawn(fx.deps.clone(), config);
        let job = wait_for_terminal(fx.jobs.as_ref(), msg.job_id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(analyzer.executions.load(Ordering::SeqCst), 1);
        let successes = fx.activity.all().iter().filter(|a| a.success).count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn takes_over_after_lease_expiry() {
        // Short lease so the crashed holder's delivery comes back quickly.
        let queue = Arc::new(InMemoryQueue::with_lease(Duration::from_millis(80)));
        let fx = fixture(Arc::new(StubAnalyzer::new()), queue);
        let msg = submit(&fx, b"body", "test").await;
        fx.queue.enqueue(&msg).await.unwrap();

        // Simulate a worker that claimed the job and died before acking.
        let crashed = fx.queue.dequeue(Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(crashed.redeliveries, 0);
        fx.jobs.claim(msg.job_id).await.unwrap();

        let handle = WorkerPool::spawn(fx.deps.clone(), fast_config());
        let job = wait_for_terminal(fx.jobs.as_ref(), msg.job_id).await;
        handle.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        assert!(fx.results.get(msg.job_id).await.unwrap().is_some());
    }
}
