//! Document gateway seam.
//!
//! Durable document state (and the authorization predicate over it) belongs
//! to an external service; the hub only talks to it through this trait. Each
//! call resolves to a success value or one of three signals the callers
//! dispatch on: not-found, permission-denied, or a transient fault worth
//! retrying.
//!
//! [`MemoryDocumentGateway`] is the in-process backend for all-in-one
//! deployments and tests; the HTTP-backed client lives in the server crate.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::epoch_ms;
use crate::ids::{DocumentId, PrincipalId};

/// Partial update applied to a document. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl DocumentUpdates {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none()
    }
}

/// A document as the gateway reports it after a read or write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub document_id: DocumentId,
    pub title: String,
    pub body: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditHistoryEntry {
    pub document_id: DocumentId,
    pub principal_id: PrincipalId,
    pub operation: String,
    pub version: i64,
}

#[derive(Debug)]
pub enum GatewayError {
    /// The document does not exist (or is invisible to the principal).
    NotFound,
    /// The principal may not perform this operation.
    PermissionDenied,
    /// I/O-level failure; the operation may succeed on retry.
    Transient(anyhow::Error),
}

impl GatewayError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::NotFound | GatewayError::PermissionDenied)
    }

    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        GatewayError::Transient(error.into())
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NotFound => f.write_str("document not found"),
            GatewayError::PermissionDenied => f.write_str("permission denied"),
            GatewayError::Transient(error) => write!(f, "transient gateway failure: {error}"),
        }
    }
}

impl std::error::Error for GatewayError {}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait DocumentGateway: Send + Sync {
    /// The document as visible to the principal.
    async fn get_document(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
    ) -> GatewayResult<DocumentRecord>;

    /// May the principal write to the document?
    async fn can_edit(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
    ) -> GatewayResult<bool>;

    /// Apply a partial update on the principal's behalf and return the
    /// document's final state. Writes to one document are serialized by the
    /// gateway.
    async fn update_document(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
        updates: &DocumentUpdates,
    ) -> GatewayResult<DocumentRecord>;

    /// Best-effort history append; callers log and swallow failures.
    async fn append_edit_history(&self, entry: &EditHistoryEntry) -> GatewayResult<()>;
}

struct StoredDocument {
    title: String,
    body: String,
    updated_at: i64,
    /// `None` means any authenticated principal may edit.
    editors: Option<HashSet<PrincipalId>>,
}

/// In-process gateway backend.
///
/// Writes to one document serialize on its map entry, matching the
/// per-document serialization the hub relies on. The failure-injection
/// counter lets tests exercise the retry and dead-letter paths.
#[derive(Default)]
pub struct MemoryDocumentGateway {
    documents: DashMap<DocumentId, StoredDocument>,
    history: Mutex<Vec<EditHistoryEntry>>,
    transient_update_failures: AtomicUsize,
}

impl MemoryDocumentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document editable by anyone.
    pub fn insert_document(&self, document_id: impl Into<DocumentId>, title: &str, body: &str) {
        self.insert_document_with_editors(document_id, title, body, None);
    }

    /// Seed a document with an explicit editor set.
    pub fn insert_document_with_editors(
        &self,
        document_id: impl Into<DocumentId>,
        title: &str,
        body: &str,
        editors: Option<HashSet<PrincipalId>>,
    ) {
        self.documents.insert(
            document_id.into(),
            StoredDocument {
                title: title.to_owned(),
                body: body.to_owned(),
                updated_at: epoch_ms(),
                editors,
            },
        );
    }

    /// Make the next `count` calls to `update_document` fail transiently.
    pub fn fail_next_updates(&self, count: usize) {
        self.transient_update_failures.store(count, Ordering::SeqCst);
    }

    pub async fn history(&self) -> Vec<EditHistoryEntry> {
        self.history.lock().await.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.transient_update_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn check_editor(
        document: &StoredDocument,
        principal_id: &PrincipalId,
    ) -> bool {
        match &document.editors {
            Some(editors) => editors.contains(principal_id),
            None => true,
        }
    }
}

#[async_trait]
impl DocumentGateway for MemoryDocumentGateway {
    async fn get_document(
        &self,
        _principal_id: &PrincipalId,
        document_id: &DocumentId,
    ) -> GatewayResult<DocumentRecord> {
        let document = self
            .documents
            .get(document_id)
            .ok_or(GatewayError::NotFound)?;
        Ok(DocumentRecord {
            document_id: document_id.clone(),
            title: document.title.clone(),
            body: document.body.clone(),
            updated_at: document.updated_at,
        })
    }

    async fn can_edit(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
    ) -> GatewayResult<bool> {
        let document = self
            .documents
            .get(document_id)
            .ok_or(GatewayError::NotFound)?;
        Ok(Self::check_editor(&document, principal_id))
    }

    async fn update_document(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
        updates: &DocumentUpdates,
    ) -> GatewayResult<DocumentRecord> {
        if self.take_injected_failure() {
            return Err(GatewayError::transient(anyhow::anyhow!(
                "injected transient failure"
            )));
        }

        let mut document = self
            .documents
            .get_mut(document_id)
            .ok_or(GatewayError::NotFound)?;
        if !Self::check_editor(&document, principal_id) {
            return Err(GatewayError::PermissionDenied);
        }

        if let Some(title) = &updates.title {
            document.title = title.clone();
        }
        if let Some(body) = &updates.body {
            document.body = body.clone();
        }
        document.updated_at = epoch_ms();

        Ok(DocumentRecord {
            document_id: document_id.clone(),
            title: document.title.clone(),
            body: document.body.clone(),
            updated_at: document.updated_at,
        })
    }

    async fn append_edit_history(&self, entry: &EditHistoryEntry) -> GatewayResult<()> {
        self.history.lock().await.push(entry.clone());
        Ok(())
    }
}
