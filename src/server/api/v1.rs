//! V1 API routes.

use axum::Router;
use axum::routing::get;
use axum::routing::post;

pub mod jobs;
pub mod logs_ws;
pub mod models;
pub mod workers;

use super::AppState;

/// Create the V1 API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/logs", get(jobs::get_job_logs))
        .route("/jobs/{id}/logs/ws", get(logs_ws::job_logs_ws))
        .route("/worker/claim", post(workers::claim))
        .route("/worker/jobs/{id}/logs", post(workers::append_logs))
        .route("/worker/jobs/{id}/finish", post(workers::finish))
        .with_state(state)
}
