//! Submission and per-job read endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Multipart, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::warn;

use finsight_core::{DispatchMessage, Job, JobId, JobStatus, DEFAULT_QUERY};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

/// Accept an upload, persist the pending job, and enqueue its dispatch
/// message. Answers immediately; the analysis runs in the worker pool.
///
/// Creating the row and enqueueing are one logical operation: if the queue
/// is unreachable, the row and the stored upload are compensated away and
/// the client gets a retryable 503.
pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> axum::response::Response {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut query = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "bad_multipart",
                    e.to_string(),
                )
            }
        };

        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .unwrap_or("document.pdf")
                    .to_string();
                let bytes = match field.bytes().await {
                    Ok(bytes) => bytes.to_vec(),
                    Err(e) => {
                        return errors::json_error(
                            StatusCode::BAD_REQUEST,
                            "bad_multipart",
                            e.to_string(),
                        )
                    }
                };
                upload = Some((filename, bytes));
            }
            Some("query") => {
                query = match field.text().await {
                    Ok(text) => text,
                    Err(e) => {
                        return errors::json_error(
                            StatusCode::BAD_REQUEST,
                            "bad_multipart",
                            e.to_string(),
                        )
                    }
                };
            }
            _ => {}
        }
    }

    let Some((filename, bytes)) = upload else {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            "file field is required",
        );
    };
    if bytes.is_empty() {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            "uploaded file is empty",
        );
    }

    let query = query.trim();
    let query = if query.is_empty() { DEFAULT_QUERY } else { query };

    let job_id = JobId::new();
    let extension = std::path::Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let file_path = services
        .upload_dir
        .join(format!("document_{job_id}{extension}"));

    if let Err(e) = tokio::fs::create_dir_all(&services.upload_dir).await {
        return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "upload_error", e.to_string());
    }
    if let Err(e) = tokio::fs::write(&file_path, &bytes).await {
        return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "upload_error", e.to_string());
    }

    let job = Job::new(job_id, &filename, query);
    if let Err(e) = services.jobs.create(&job).await {
        let _ = tokio::fs::remove_file(&file_path).await;
        return errors::store_error_to_response(e);
    }

    let mut message = DispatchMessage::new(
        job_id,
        file_path.to_string_lossy().into_owned(),
        query,
        &filename,
    )
    .with_file_size(bytes.len() as i64);
    if let Some(origin) = client_origin(&headers) {
        message = message.with_client_origin(origin);
    }

    if let Err(e) = services.queue.enqueue(&message).await {
        // Not submitted until the message is on the queue: roll the row and
        // the upload back and let the client retry.
        warn!(job_id = %job_id, error = %e, "enqueue failed; compensating submission");
        let _ = services.jobs.delete(job_id).await;
        let _ = tokio::fs::remove_file(&file_path).await;
        return errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string());
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "job_id": job_id.to_string(),
            "status": JobStatus::Pending,
        })),
    )
        .into_response()
}

pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id")
        }
    };

    match services.jobs.get(job_id).await {
        Ok(Some(job)) => Json(dto::StatusResponse::from(job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "unknown job id"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Serve the finished report, or explain why it is not available yet:
/// 202 while the job is still moving, 500 with the captured error when it
/// failed, 404 when it never existed.
pub async fn result(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id")
        }
    };

    match services.results.get(job_id).await {
        Ok(Some(result)) => Json(dto::ResultResponse::from(result)).into_response(),
        Ok(None) => match services.jobs.get(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Failed => errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "analysis_failed",
                job.error_message.unwrap_or_else(|| "analysis failed".to_string()),
            ),
            Ok(Some(job)) => (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "job_id": job_id.to_string(),
                    "status": job.status,
                    "message": "analysis not finished; retry later",
                })),
            )
                .into_response(),
            Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "unknown job id"),
            Err(e) => errors::store_error_to_response(e),
        },
        Err(e) => errors::store_error_to_response(e),
    }
}

fn client_origin(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = forwarded.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_string())
}
