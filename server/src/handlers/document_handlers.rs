// Document intake and warm reads

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use cowrite_core::documents::DocumentUpdates;
use cowrite_core::epoch_ms;
use cowrite_core::ids::{DocumentId, JobId};
use cowrite_core::queue::{DocumentUpdatePayload, JobPayload};

use crate::auth::authenticate_request;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateDocumentRequest {
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateDocumentResponse {
    pub job_id: Option<JobId>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// `POST /documents/{id}` — authorize, skip no-ops, enqueue the rest.
///
/// The slow durable write happens asynchronously in the worker; the
/// response only promises that a job exists.
pub(crate) async fn update_document_handler(
    Path(document_id): Path<DocumentId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateDocumentRequest>,
) -> Result<Json<UpdateDocumentResponse>, AppError> {
    let principal = authenticate_request(&state.signer, &headers)?;

    if request.title.is_none() && request.body.is_none() {
        return Err(AppError::bad_request(
            "nothing to update: provide title and/or body",
        ));
    }

    let can_edit = state
        .documents
        .can_edit(&principal.principal_id, &document_id)
        .await
        .map_err(|error| AppError::from_gateway(error, &document_id))?;
    if !can_edit {
        return Err(AppError::document_access_denied(&document_id));
    }

    let changed = match &request.body {
        Some(body) => {
            state
                .content
                .has_changed(&document_id, body, request.title.as_deref())
                .await
                .changed
        }
        // Title-only save: compare against the cached title; no snapshot
        // means there is nothing to dedupe against.
        None => match state.content.get(&document_id).await {
            Some(snapshot) => request
                .title
                .as_deref()
                .is_some_and(|title| title != snapshot.title),
            None => true,
        },
    };

    if !changed {
        return Ok(Json(UpdateDocumentResponse {
            job_id: None,
            status: "skipped",
            reason: Some("no_changes"),
        }));
    }

    let payload = JobPayload::DocumentUpdate(DocumentUpdatePayload {
        document_id: document_id.clone(),
        principal_id: principal.principal_id.clone(),
        updates: DocumentUpdates {
            title: request.title,
            body: request.body,
        },
        metadata: json!({
            "requestedAt": epoch_ms(),
            "displayName": principal.display_name,
        }),
    });
    let job_id = state
        .queue
        .enqueue(payload)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(UpdateDocumentResponse {
        job_id: Some(job_id),
        status: "queued",
        reason: None,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DocumentContentResponse {
    pub document_id: DocumentId,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub source: &'static str,
}

/// `GET /documents/{id}/content` — serve the cached snapshot when warm,
/// fall through to the gateway (and warm the cache) otherwise.
pub(crate) async fn get_document_content_handler(
    Path(document_id): Path<DocumentId>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DocumentContentResponse>, AppError> {
    let principal = authenticate_request(&state.signer, &headers)?;

    // The hub carries no separate read predicate; collaborators hold edit
    // permission, so that is the gate for warm reads too.
    let can_edit = state
        .documents
        .can_edit(&principal.principal_id, &document_id)
        .await
        .map_err(|error| AppError::from_gateway(error, &document_id))?;
    if !can_edit {
        return Err(AppError::document_access_denied(&document_id));
    }

    if let Some(snapshot) = state.content.get(&document_id).await {
        return Ok(Json(DocumentContentResponse {
            document_id,
            title: snapshot.title,
            body: snapshot.body,
            version: Some(snapshot.version),
            source: "cache",
        }));
    }

    let record = state
        .documents
        .get_document(&principal.principal_id, &document_id)
        .await
        .map_err(|error| AppError::from_gateway(error, &document_id))?;

    let version = match state
        .content
        .put(&document_id, &record.body, &record.title)
        .await
    {
        Ok(snapshot) => Some(snapshot.version),
        Err(error) => {
            warn!(document_id = %document_id, %error, "failed to warm content cache");
            None
        }
    };

    Ok(Json(DocumentContentResponse {
        document_id,
        title: record.title,
        body: record.body,
        version,
        source: "gateway",
    }))
}
