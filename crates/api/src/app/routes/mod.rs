use axum::{
    routing::{get, post},
    Router,
};

pub mod analyze;
pub mod history;
pub mod system;

/// Router for all pipeline endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/analyze", post(analyze::submit))
        .route("/analyze/:job_id/status", get(analyze::status))
        .route("/analyze/:job_id/result", get(analyze::result))
        .route("/history", get(history::history))
        .route("/stats", get(history::stats))
}
