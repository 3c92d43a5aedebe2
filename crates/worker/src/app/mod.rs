//! Admin HTTP surface: health, stats, and job submission.

pub mod errors;
pub mod routes;

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};

use portaljobs_infra::jobs::{
    BudgetThrottle, JobProducer, JobStore, TracingTelemetry, WorkerHandle,
};

/// Everything the admin routes read from.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: Arc<dyn JobStore>,
    pub producer: JobProducer,
    pub worker: WorkerHandle,
    pub budget: Arc<BudgetThrottle>,
    pub telemetry: Arc<TracingTelemetry>,
}

pub fn build_app(services: AppServices) -> Router {
    Router::new()
        .route("/healthz", get(routes::health))
        .route("/stats", get(routes::stats))
        .route("/jobs", post(routes::submit_job).get(routes::list_jobs))
        .route("/jobs/:id", get(routes::get_job))
        .layer(Extension(Arc::new(services)))
}
