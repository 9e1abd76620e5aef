//! Black-box tests over the HTTP surface, with a real worker pool attached
//! to the same in-memory stores and queue.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use finsight_analyzer::{Analyzer, AnalyzerError};
use finsight_api::app::{build_app, AppServices};
use finsight_core::{ActivityRecord, AnalysisResult, DispatchMessage, Job, JobId, JobStatus};
use finsight_infra::queue::{Delivery, QueueError, TaskQueue};
use finsight_infra::store::{ActivityStore, JobStore, ResultStore};
use finsight_worker::{WorkerConfig, WorkerDeps, WorkerPool, WorkerPoolHandle};

const STUB_REPORT: &str = "stub analysis report";

struct StubAnalyzer;

#[async_trait]
impl Analyzer for StubAnalyzer {
    async fn execute(&self, _file_path: &Path, _query: &str) -> Result<String, AnalyzerError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(STUB_REPORT.to_string())
    }
}

/// Queue whose broker is never reachable.
struct DownQueue;

#[async_trait]
impl TaskQueue for DownQueue {
    async fn enqueue(&self, _message: &DispatchMessage) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }

    async fn dequeue(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }
}

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
    _upload_dir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let upload_dir = tempfile::tempdir().expect("failed to create upload dir");
        let services = Arc::new(AppServices::in_memory(upload_dir.path().to_path_buf()));
        Self::spawn_with(services, upload_dir).await
    }

    async fn spawn_with(services: Arc<AppServices>, upload_dir: tempfile::TempDir) -> Self {
        // Build the same router as prod, but bind to an ephemeral port.
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
            _upload_dir: upload_dir,
        }
    }

    /// Attach a worker pool to the server's stores and queue.
    fn spawn_workers(&self, analyzer: Arc<dyn Analyzer>) -> WorkerPoolHandle {
        let deps = WorkerDeps {
            jobs: self.services.jobs.clone(),
            results: self.services.results.clone(),
            activity: self.services.activity.clone(),
            queue: self.services.queue.clone(),
            analyzer,
        };
        let config = WorkerConfig {
            concurrency: 1,
            dequeue_wait: Duration::from_millis(20),
            ..WorkerConfig::default()
        };
        WorkerPool::spawn(deps, config)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit_document(
    client: &reqwest::Client,
    base_url: &str,
    body: &[u8],
    query: Option<&str>,
) -> reqwest::Response {
    let mut form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(body.to_vec()).file_name("sample.pdf"),
    );
    if let Some(query) = query {
        form = form.text("query", query.to_string());
    }

    client
        .post(format!("{}/analyze", base_url))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

/// Poll the status endpoint until the job reaches a terminal state,
/// collecting every status seen along the way.
async fn poll_until_terminal(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
) -> (serde_json::Value, Vec<String>) {
    let mut seen = Vec::new();
    for _ in 0..300 {
        let res = client
            .get(format!("{}/analyze/{}/status", base_url, job_id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();

        let status = body["status"].as_str().unwrap().to_string();
        if seen.last() != Some(&status) {
            seen.push(status.clone());
        }
        if status == "completed" || status == "failed" {
            return (body, seen);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job did not reach a terminal state in time");
}

#[tokio::test]
async fn end_to_end_submit_poll_result() {
    let server = TestServer::spawn().await;
    let workers = server.spawn_workers(Arc::new(StubAnalyzer));
    let client = reqwest::Client::new();

    let res = submit_document(&client, &server.base_url, b"ten bytes!", Some("test")).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, seen) = poll_until_terminal(&client, &server.base_url, &job_id).await;
    workers.shutdown().await;

    assert_eq!(status["status"], "completed");
    assert_eq!(status["filename"], "sample.pdf");
    assert!(status["completed_at"].is_string());
    // Only legal statuses, in order, ever surface.
    for s in &seen {
        assert!(["pending", "processing", "completed"].contains(&s.as_str()));
    }
    assert_eq!(seen.last().unwrap(), "completed");

    let res = client
        .get(format!("{}/analyze/{}/result", server.base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let result: serde_json::Value = res.json().await.unwrap();
    assert_eq!(result["analysis"], STUB_REPORT);
    assert_eq!(result["query"], "test");
    assert!(result["processing_time"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn empty_file_is_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit_document(&client, &server.base_url, b"", Some("test")).await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn blank_query_defaults_to_standard_prompt() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit_document(&client, &server.base_url, b"content", None).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap();

    let res = client
        .get(format!("{}/analyze/{}/status", server.base_url, job_id))
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(
        status["query"],
        "Analyze this financial document for investment insights"
    );
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let unknown = JobId::new();

    for endpoint in ["status", "result"] {
        let res = client
            .get(format!("{}/analyze/{}/{}", server.base_url, unknown, endpoint))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    let res = client
        .get(format!("{}/analyze/not-a-uuid/status", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn result_before_completion_asks_to_retry() {
    // No workers attached: the job stays pending.
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit_document(&client, &server.base_url, b"content", Some("q")).await;
    let body: serde_json::Value = res.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap();

    let res = client
        .get(format!("{}/analyze/{}/result", server.base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn failed_job_result_surfaces_the_error() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // A job whose attempt failed, written directly through the stores.
    let job = Job::new(JobId::new(), "sample.pdf", "q");
    server.services.jobs.create(&job).await.unwrap();
    server.services.jobs.claim(job.job_id).await.unwrap();
    server
        .services
        .jobs
        .transition(job.job_id, JobStatus::Failed, Some("analyzer exploded".into()))
        .await
        .unwrap();

    let res = client
        .get(format!("{}/analyze/{}/result", server.base_url, job.job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "analysis_failed");
    assert_eq!(body["message"], "analyzer exploded");

    let res = client
        .get(format!("{}/analyze/{}/status", server.base_url, job.job_id))
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["status"], "failed");
    assert_eq!(status["error"], "analyzer exploded");
}

#[tokio::test]
async fn history_paginates_newest_first() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for i in 0..15 {
        let result = AnalysisResult::new(JobId::new(), format!("doc{i}.pdf"), "q", "body", 1.0);
        server.services.results.put(&result).await.unwrap();
    }

    let res = client
        .get(format!("{}/history?limit=10&offset=0", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["total"], 15);
    assert_eq!(page["results"].as_array().unwrap().len(), 10);

    let res = client
        .get(format!("{}/history?limit=10&offset=10", server.base_url))
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["total"], 15);
    assert_eq!(page["results"].as_array().unwrap().len(), 5);

    let res = client
        .get(format!("{}/history?offset=-1", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn stats_reports_success_rate() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for success in [true, true, true, false] {
        let record = ActivityRecord::new(JobId::new(), None, Some(10), 4, success);
        server.services.activity.record(&record).await.unwrap();
    }

    let res = client
        .get(format!("{}/stats", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["success_rate"], 75.0);
    assert!(stats["jobs"]["pending"].is_number());
}

#[tokio::test]
async fn unreachable_queue_compensates_the_submission() {
    let upload_dir = tempfile::tempdir().unwrap();
    let mut services = AppServices::in_memory(upload_dir.path().to_path_buf());
    services.queue = Arc::new(DownQueue);
    let server = TestServer::spawn_with(Arc::new(services), upload_dir).await;
    let client = reqwest::Client::new();

    let res = submit_document(&client, &server.base_url, b"content", Some("q")).await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "queue_unavailable");

    // The job row was rolled back and the upload removed: nothing was
    // submitted.
    let counts = server.services.jobs.counts().await.unwrap();
    assert_eq!(counts.total(), 0);
    let leftovers = std::fs::read_dir(server._upload_dir.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn health_endpoint_answers() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}
