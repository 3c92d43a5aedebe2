use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;

use portaljobs_infra::jobs::{JobId, JobState, SubmitRequest};

use super::AppServices;
use super::errors::{json_error, store_error_to_response, submit_error_to_response};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = match services.jobs.stats().await {
        Ok(stats) => stats,
        Err(e) => return store_error_to_response(e),
    };
    let budget = match services.budget.current(Utc::now()).await {
        Ok(snapshot) => snapshot,
        Err(e) => return store_error_to_response(e),
    };

    Json(serde_json::json!({
        "queues": jobs.queues,
        "worker": services.worker.stats(),
        "governors": services.telemetry.governor_counts(),
        "budget": budget,
    }))
    .into_response()
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<SubmitRequest>,
) -> axum::response::Response {
    match services.producer.submit(req).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "job_id": id.to_string() })),
        )
            .into_response(),
        Err(e) => submit_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = JobId::from_str(&id) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid_job_id", "job id must be a UUID");
    };
    match services.jobs.get(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Err(e) => store_error_to_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub state: String,
    pub limit: Option<usize>,
}

/// `GET /jobs?state=DEAD&limit=20`: oldest first.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListQuery>,
) -> axum::response::Response {
    let Ok(state) = JobState::from_str(&query.state) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "invalid_state",
            "state must be one of: PENDING, CLAIMED, RUNNING, SUCCEEDED, FAILED, DEAD",
        );
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

    match services.jobs.list_by_state(state, limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => store_error_to_response(e),
    }
}
