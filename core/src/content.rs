//! Last-known document content cache.
//!
//! Holds the canonical latest `{body, title}` snapshot per document with a
//! ~1 hour TTL, refreshed whenever a persistence job completes. Its two
//! jobs: make duplicate saves free (`has_changed`) and serve warm reads
//! without a gateway round-trip.
//!
//! Failure posture is fail-safe towards persistence: if the store cannot be
//! consulted, `has_changed` answers `true` and the write goes through.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::SharedCache;
use crate::epoch_ms;
use crate::ids::DocumentId;

const CONTENT_KEY_PREFIX: &str = "doc:content:";

fn content_key(document_id: &DocumentId) -> String {
    format!("{CONTENT_KEY_PREFIX}{document_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    pub body: String,
    pub title: String,
    /// Epoch ms at which the snapshot was cached.
    pub cached_at: i64,
    /// Monotonic per-document version; never decreases.
    pub version: i64,
}

/// Answer from [`ContentCache::has_changed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCheck {
    pub changed: bool,
    pub cached_body: Option<String>,
    pub cached_title: Option<String>,
}

impl ChangeCheck {
    fn changed_without_baseline() -> Self {
        Self {
            changed: true,
            cached_body: None,
            cached_title: None,
        }
    }
}

#[derive(Clone)]
pub struct ContentCache {
    store: SharedCache,
    ttl: Duration,
}

impl ContentCache {
    pub fn new(store: SharedCache, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// The cached snapshot, or `None` on miss. Store errors degrade to a
    /// miss with a warning; callers fall through to the document gateway.
    pub async fn get(&self, document_id: &DocumentId) -> Option<ContentSnapshot> {
        let key = content_key(document_id);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(error) => {
                warn!(document_id = %document_id, %error, "content cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                warn!(
                    document_id = %document_id,
                    %error,
                    "discarding undecodable content snapshot"
                );
                None
            }
        }
    }

    /// Store a fresh snapshot, advancing the version and resetting the TTL.
    pub async fn put(
        &self,
        document_id: &DocumentId,
        body: &str,
        title: &str,
    ) -> Result<ContentSnapshot> {
        let now = epoch_ms();
        // Wall clock may step backwards between instances; the version must
        // not.
        let version = match self.get(document_id).await {
            Some(previous) => now.max(previous.version + 1),
            None => now,
        };
        let snapshot = ContentSnapshot {
            body: body.to_owned(),
            title: title.to_owned(),
            cached_at: now,
            version,
        };
        let encoded = serde_json::to_string(&snapshot).context("serialize content snapshot")?;
        self.store
            .set(&content_key(document_id), &encoded, Some(self.ttl))
            .await?;
        Ok(snapshot)
    }

    /// Would persisting `new_body` (and optionally `new_title`) change
    /// anything relative to the cached snapshot?
    ///
    /// No snapshot — or no way to read one — counts as changed.
    pub async fn has_changed(
        &self,
        document_id: &DocumentId,
        new_body: &str,
        new_title: Option<&str>,
    ) -> ChangeCheck {
        let Some(snapshot) = self.get(document_id).await else {
            return ChangeCheck::changed_without_baseline();
        };

        let body_changed = new_body != snapshot.body;
        let title_changed = new_title.is_some_and(|title| title != snapshot.title);

        ChangeCheck {
            changed: body_changed || title_changed,
            cached_body: Some(snapshot.body),
            cached_title: Some(snapshot.title),
        }
    }

    pub async fn invalidate(&self, document_id: &DocumentId) -> Result<()> {
        self.store.del(&content_key(document_id)).await?;
        Ok(())
    }
}
