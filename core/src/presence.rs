//! Distributed presence registry.
//!
//! The authoritative record of who is editing which document lives in the
//! cache store, one hash per document keyed by principal. The hash carries a
//! TTL refreshed on every mutation, so sessions left behind by a crashed
//! instance disappear on their own; [`PresenceRegistry::sweep_stale`]
//! additionally reaps individual fields whose `last_active` has gone quiet.
//!
//! In-process connection state is deliberately *not* kept here — each server
//! instance owns its own socket index, and the two representations must not
//! be conflated.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::cache::SharedCache;
use crate::epoch_ms;
use crate::ids::{DocumentId, PrincipalId, SocketId};

const SESSION_KEY_PREFIX: &str = "session:";

pub fn session_key(document_id: &DocumentId) -> String {
    format!("{SESSION_KEY_PREFIX}{document_id}")
}

/// One principal's live attachment to a document through one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub principal_id: PrincipalId,
    pub display_name: String,
    pub socket_id: SocketId,
    /// Epoch milliseconds of the last observed activity.
    pub last_active: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub documents_scanned: usize,
    pub sessions_removed: usize,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    store: SharedCache,
    session_ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(store: SharedCache, session_ttl: Duration) -> Self {
        Self { store, session_ttl }
    }

    /// Create or overwrite the principal's session in the document's hash.
    ///
    /// A duplicate join from the same principal supersedes the previous
    /// session wholesale (last-writer-wins on `socket_id`); the superseded
    /// connection discovers its obsolescence through natural disconnect or
    /// the TTL sweep.
    pub async fn add_session(
        &self,
        document_id: &DocumentId,
        principal_id: &PrincipalId,
        display_name: &str,
        socket_id: &SocketId,
        cursor: Option<JsonValue>,
    ) -> Result<SessionRecord> {
        let record = SessionRecord {
            principal_id: principal_id.clone(),
            display_name: display_name.to_owned(),
            socket_id: socket_id.clone(),
            last_active: epoch_ms(),
            cursor,
        };
        self.write_session(document_id, &record).await?;
        Ok(record)
    }

    /// Remove the principal's session; drops the hash once it is empty.
    pub async fn remove_session(
        &self,
        document_id: &DocumentId,
        principal_id: &PrincipalId,
    ) -> Result<bool> {
        let key = session_key(document_id);
        let removed = self.store.hdel(&key, principal_id.as_str()).await?;
        if removed && self.store.hlen(&key).await? == 0 {
            self.store.del(&key).await?;
        }
        Ok(removed)
    }

    /// Fetch the principal's current session, if any.
    pub async fn get_session(
        &self,
        document_id: &DocumentId,
        principal_id: &PrincipalId,
    ) -> Result<Option<SessionRecord>> {
        let key = session_key(document_id);
        let Some(raw) = self.store.hget(&key, principal_id.as_str()).await? else {
            return Ok(None);
        };
        Ok(decode_session(document_id, principal_id.as_str(), &raw))
    }

    /// Bump `last_active` and refresh the hash TTL. A missing session is a
    /// no-op (the field may already belong to nobody after a sweep).
    pub async fn touch(&self, document_id: &DocumentId, principal_id: &PrincipalId) -> Result<()> {
        self.mutate_session(document_id, principal_id, |record| {
            record.last_active = epoch_ms();
        })
        .await
    }

    /// Replace the cursor blob, bumping `last_active` as a side effect.
    pub async fn update_cursor(
        &self,
        document_id: &DocumentId,
        principal_id: &PrincipalId,
        cursor: JsonValue,
    ) -> Result<()> {
        self.mutate_session(document_id, principal_id, |record| {
            record.last_active = epoch_ms();
            record.cursor = Some(cursor);
        })
        .await
    }

    /// All sessions currently attached to the document.
    pub async fn list_sessions(&self, document_id: &DocumentId) -> Result<Vec<SessionRecord>> {
        let key = session_key(document_id);
        let fields = self.store.hgetall(&key).await?;
        Ok(decode_all(document_id, fields))
    }

    pub async fn count_sessions(&self, document_id: &DocumentId) -> Result<usize> {
        let key = session_key(document_id);
        self.store.hlen(&key).await
    }

    /// Every document with at least one live session, cluster-wide.
    pub async fn list_active_documents(&self) -> Result<Vec<DocumentId>> {
        let keys = self.store.keys_with_prefix(SESSION_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(SESSION_KEY_PREFIX)
                    .map(DocumentId::from)
            })
            .collect())
    }

    /// Reap sessions whose `last_active` is older than the session TTL, and
    /// drop hashes that end up empty. Safe to run from any instance.
    pub async fn sweep_stale(&self) -> Result<SweepReport> {
        let cutoff = epoch_ms() - self.session_ttl.as_millis() as i64;
        let mut report = SweepReport::default();

        for document_id in self.list_active_documents().await? {
            report.documents_scanned += 1;
            let key = session_key(&document_id);
            let fields = self.store.hgetall(&key).await?;

            for (field, raw) in &fields {
                let stale = match decode_session(&document_id, field, raw) {
                    Some(record) => record.last_active < cutoff,
                    // Undecodable field: remove it rather than let it pin
                    // the hash alive forever.
                    None => true,
                };
                if stale && self.store.hdel(&key, field).await? {
                    report.sessions_removed += 1;
                    debug!(
                        document_id = %document_id,
                        principal_id = %field,
                        "swept stale session"
                    );
                }
            }

            if self.store.hlen(&key).await? == 0 {
                self.store.del(&key).await?;
            }
        }

        Ok(report)
    }

    async fn mutate_session(
        &self,
        document_id: &DocumentId,
        principal_id: &PrincipalId,
        apply: impl FnOnce(&mut SessionRecord),
    ) -> Result<()> {
        let Some(mut record) = self.get_session(document_id, principal_id).await? else {
            return Ok(());
        };
        apply(&mut record);
        self.write_session(document_id, &record).await
    }

    async fn write_session(&self, document_id: &DocumentId, record: &SessionRecord) -> Result<()> {
        let key = session_key(document_id);
        let encoded = serde_json::to_string(record).context("serialize session record")?;
        self.store
            .hset(&key, record.principal_id.as_str(), &encoded)
            .await?;
        self.store.expire(&key, self.session_ttl).await?;
        Ok(())
    }
}

fn decode_all(
    document_id: &DocumentId,
    fields: HashMap<String, String>,
) -> Vec<SessionRecord> {
    let mut sessions: Vec<SessionRecord> = fields
        .iter()
        .filter_map(|(field, raw)| decode_session(document_id, field, raw))
        .collect();
    sessions.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
    sessions
}

fn decode_session(document_id: &DocumentId, field: &str, raw: &str) -> Option<SessionRecord> {
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(error) => {
            warn!(
                document_id = %document_id,
                principal_id = %field,
                %error,
                "discarding undecodable session record"
            );
            None
        }
    }
}
