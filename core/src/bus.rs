//! Document fan-out bus.
//!
//! One topic per document, named `channel:{documentId}`, carried over the
//! cache store's pub/sub. Every published envelope is stamped with the
//! originating socket id so receivers can suppress the echo back to the
//! sender; suppression happens at the gateway during local fan-out, never
//! here.
//!
//! Delivery is at-least-once to attached subscribers with no persistence
//! and no cross-topic ordering; the CRDT layer upstream is commutative and
//! awareness is last-writer-wins, so neither needs ordering from the bus.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::cache::{SharedCache, Subscription};
use crate::ids::{DocumentId, SocketId};

pub fn topic(document_id: &DocumentId) -> String {
    format!("channel:{document_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastKind {
    UserJoined,
    UserLeft,
    CrdtUpdate,
    AwarenessUpdate,
}

impl BroadcastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastKind::UserJoined => "user-joined",
            BroadcastKind::UserLeft => "user-left",
            BroadcastKind::CrdtUpdate => "crdt-update",
            BroadcastKind::AwarenessUpdate => "awareness-update",
        }
    }
}

/// What travels on a topic: the client-ready payload plus the originating
/// socket tag. Filtering must use the socket id, not the principal — the
/// same principal on two devices should see each device's edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    pub origin: SocketId,
    pub data: JsonValue,
}

impl BusEnvelope {
    pub fn new(kind: BroadcastKind, origin: SocketId, data: JsonValue) -> Self {
        Self { kind, origin, data }
    }
}

#[derive(Clone)]
pub struct DocumentBus {
    store: SharedCache,
}

impl DocumentBus {
    pub fn new(store: SharedCache) -> Self {
        Self { store }
    }

    /// Publish an envelope on the document's topic. Returns the number of
    /// subscribers the backend reached.
    pub async fn publish(&self, document_id: &DocumentId, envelope: &BusEnvelope) -> Result<usize> {
        let payload = serde_json::to_string(envelope).context("serialize bus envelope")?;
        self.store.publish(&topic(document_id), &payload).await
    }

    /// Attach to the document's topic. The returned handle is the
    /// subscription; dropping it detaches.
    pub async fn subscribe(&self, document_id: &DocumentId) -> Result<BusSubscription> {
        let inner = self.store.subscribe(&topic(document_id)).await?;
        Ok(BusSubscription {
            document_id: document_id.clone(),
            inner,
        })
    }
}

pub struct BusSubscription {
    document_id: DocumentId,
    inner: Subscription,
}

impl BusSubscription {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Next envelope on the topic, or `None` once the topic is closed.
    /// Undecodable payloads are skipped.
    pub async fn recv(&mut self) -> Option<BusEnvelope> {
        loop {
            let payload = self.inner.recv().await?;
            match serde_json::from_str(&payload) {
                Ok(envelope) => return Some(envelope),
                Err(error) => {
                    warn!(
                        document_id = %self.document_id,
                        %error,
                        "skipping undecodable bus envelope"
                    );
                }
            }
        }
    }
}
