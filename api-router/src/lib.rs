use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};

use api_state::ApiState;
use routes::{
    health::health,
    jobs::{cancel_job, get_job, list_jobs, submit_job},
};

pub mod api_state;
pub mod error;
pub mod middleware_correlation;
mod routes;

/// Full HTTP surface: versioned job endpoints plus the health probes,
/// with correlation-id handling on every request.
pub fn api_routes(state: ApiState) -> Router {
    let v1 = Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{job_id}", get(get_job).delete(cancel_job))
        .route("/health", get(health));

    Router::new()
        .nest("/api/v1", v1)
        .route("/health", get(health))
        .layer(from_fn(middleware_correlation::correlation_id))
        .with_state(state)
}
