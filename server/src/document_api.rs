//! REST client for a separately deployed document service.
//!
//! The wire contract mirrors the gateway trait one-to-one:
//!
//! - `GET  {base}/internal/documents/{id}?principalId={p}` → document record
//! - `GET  {base}/internal/documents/{id}/permissions/{p}` → `{"canEdit": bool}`
//! - `PATCH {base}/internal/documents/{id}` with `{principalId, title?, body?}` → record
//! - `POST {base}/internal/documents/{id}/history` with an entry → 204
//!
//! Status mapping: 404 is not-found, 403 is permission-denied, everything
//! else that fails (including transport errors and timeouts) is transient.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use cowrite_core::documents::{
    DocumentGateway, DocumentRecord, DocumentUpdates, EditHistoryEntry, GatewayError,
    GatewayResult,
};
use cowrite_core::ids::{DocumentId, PrincipalId};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpDocumentGateway {
    client: reqwest::Client,
    base_url: String,
    service_token: Option<String>,
}

impl HttpDocumentGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("reqwest client builds with static configuration");
        let service_token = env::var("COWRITE_DOCUMENT_API_TOKEN")
            .ok()
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            service_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
        match map_status(response.status()) {
            Some(error) => Err(error),
            None => Ok(response),
        }
    }
}

/// Non-success statuses onto the gateway outcome taxonomy; `None` for
/// success.
fn map_status(status: StatusCode) -> Option<GatewayError> {
    if status.is_success() {
        return None;
    }
    match status {
        StatusCode::NOT_FOUND => Some(GatewayError::NotFound),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Some(GatewayError::PermissionDenied),
        other => Some(GatewayError::transient(anyhow::anyhow!(
            "document service answered {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionResponse {
    can_edit: bool,
}

#[async_trait]
impl DocumentGateway for HttpDocumentGateway {
    async fn get_document(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
    ) -> GatewayResult<DocumentRecord> {
        let url = self.url(&format!("/internal/documents/{document_id}"));
        let response = self
            .request(self.client.get(&url))
            .query(&[("principalId", principal_id.as_str())])
            .send()
            .await
            .map_err(GatewayError::transient)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(GatewayError::transient)
    }

    async fn can_edit(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
    ) -> GatewayResult<bool> {
        let url = self.url(&format!(
            "/internal/documents/{document_id}/permissions/{principal_id}"
        ));
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(GatewayError::transient)?;
        let permission: PermissionResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(GatewayError::transient)?;
        Ok(permission.can_edit)
    }

    async fn update_document(
        &self,
        principal_id: &PrincipalId,
        document_id: &DocumentId,
        updates: &DocumentUpdates,
    ) -> GatewayResult<DocumentRecord> {
        let url = self.url(&format!("/internal/documents/{document_id}"));
        let mut payload = json!({ "principalId": principal_id });
        if let Some(title) = &updates.title {
            payload["title"] = json!(title);
        }
        if let Some(body) = &updates.body {
            payload["body"] = json!(body);
        }

        let response = self
            .request(self.client.patch(&url))
            .json(&payload)
            .send()
            .await
            .map_err(GatewayError::transient)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(GatewayError::transient)
    }

    async fn append_edit_history(&self, entry: &EditHistoryEntry) -> GatewayResult<()> {
        let url = self.url(&format!(
            "/internal/documents/{}/history",
            entry.document_id
        ));
        let response = self
            .request(self.client.post(&url))
            .json(entry)
            .send()
            .await
            .map_err(GatewayError::transient)?;
        Self::check(response).await?;
        Ok(())
    }
}
