// Liveness and operator views

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::warn;

use cowrite_core::ids::DocumentId;

use crate::auth::authenticate_request;
use crate::error::AppError;
use crate::state::{AppState, MetricsSnapshot};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub cache_store: &'static str,
    pub subscribed_documents: usize,
    pub metrics: MetricsSnapshot,
}

/// `GET /health` — unauthenticated liveness probe.
pub(crate) async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache_store = match probe_cache(&state).await {
        true => "ok",
        false => "degraded",
    };
    Json(HealthResponse {
        status: if cache_store == "ok" { "ok" } else { "degraded" },
        cache_store,
        subscribed_documents: state.topics.subscribed_documents().len(),
        metrics: state.metrics.snapshot(),
    })
}

async fn probe_cache(state: &AppState) -> bool {
    let write = state
        .cache
        .set("health:ping", "pong", Some(Duration::from_secs(5)))
        .await;
    if let Err(error) = write {
        warn!(%error, "cache store probe write failed");
        return false;
    }
    match state.cache.get("health:ping").await {
        Ok(Some(value)) => value == "pong",
        Ok(None) => false,
        Err(error) => {
            warn!(%error, "cache store probe read failed");
            false
        }
    }
}

/// `GET /presence/{id}` — operator view of a document's live sessions.
pub(crate) async fn get_presence_handler(
    Path(document_id): Path<DocumentId>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<JsonValue>, AppError> {
    authenticate_request(&state.signer, &headers)?;
    let sessions = state
        .presence
        .list_sessions(&document_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({
        "documentId": document_id,
        "count": sessions.len(),
        "sessions": sessions,
    })))
}
