//! Read-only aggregate endpoints: history and statistics.

use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::HistoryParams>,
) -> axum::response::Response {
    let limit = params.limit.unwrap_or(10);
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            "offset must be >= 0",
        );
    }

    match services.results.list(limit, offset as u32).await {
        Ok(page) => Json(dto::HistoryResponse {
            total: page.total,
            results: page.results.into_iter().map(Into::into).collect(),
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let counts = match services.jobs.counts().await {
        Ok(counts) => counts,
        Err(e) => return errors::store_error_to_response(e),
    };
    let average_processing_time = match services.results.average_processing_time().await {
        Ok(avg) => avg,
        Err(e) => return errors::store_error_to_response(e),
    };
    let totals = match services.activity.totals().await {
        Ok(totals) => totals,
        Err(e) => return errors::store_error_to_response(e),
    };

    Json(serde_json::json!({
        "jobs": counts,
        "average_processing_time": average_processing_time,
        "success_rate": totals.success_rate(),
    }))
    .into_response()
}
