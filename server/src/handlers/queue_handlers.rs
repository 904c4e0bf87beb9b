// Queue administration

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use cowrite_core::ids::JobId;
use cowrite_core::queue::{QueueJob, QueueStats};

use crate::auth::authenticate_request;
use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_FAILED_LIMIT: usize = 50;

pub(crate) async fn queue_stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueStats>, AppError> {
    authenticate_request(&state.signer, &headers)?;
    state
        .queue
        .stats()
        .await
        .map(Json)
        .map_err(AppError::internal)
}

#[derive(Debug, Deserialize)]
pub(crate) struct FailedJobsQuery {
    limit: Option<usize>,
}

pub(crate) async fn failed_jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<FailedJobsQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<QueueJob>>, AppError> {
    authenticate_request(&state.signer, &headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT);
    state
        .queue
        .failed_jobs(limit)
        .await
        .map(Json)
        .map_err(AppError::internal)
}

pub(crate) async fn retry_failed_job_handler(
    Path(job_id): Path<JobId>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<JsonValue>, AppError> {
    authenticate_request(&state.signer, &headers)?;
    let requeued = state
        .queue
        .retry_failed_job(&job_id)
        .await
        .map_err(AppError::internal)?;
    if !requeued {
        return Err(AppError::job_not_found(&job_id));
    }
    Ok(Json(json!({ "jobId": job_id, "status": "queued" })))
}

pub(crate) async fn clear_queues_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<JsonValue>, AppError> {
    authenticate_request(&state.signer, &headers)?;
    state.queue.clear_all().await.map_err(AppError::internal)?;
    Ok(Json(json!({ "status": "cleared" })))
}
