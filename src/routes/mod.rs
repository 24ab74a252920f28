pub mod health;
pub mod jobs;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Build the job API router. The /metrics route is attached separately in
/// main because it carries its own recorder state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/jobs/:job_id/status", get(jobs::get_job_status))
        .route("/jobs/:job_id/result", get(jobs::get_job_result))
        .route("/healthz", get(health::health_check))
        .with_state(state)
}
