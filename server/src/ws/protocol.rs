//! Realtime wire protocol.
//!
//! Every frame is a JSON text message `{"type": ..., "data": {...}}`. The
//! `update` fields carry base64 CRDT/awareness deltas that the hub forwards
//! byte-for-byte without interpretation.

use cowrite_core::bus::BroadcastKind;
use cowrite_core::ids::{DocumentId, PrincipalId, SocketId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Frames accepted from clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    JoinDocument { document_id: DocumentId },
    #[serde(rename_all = "camelCase")]
    LeaveDocument { document_id: DocumentId },
    #[serde(rename_all = "camelCase")]
    CrdtUpdate {
        document_id: DocumentId,
        update: String,
    },
    #[serde(rename_all = "camelCase")]
    AwarenessUpdate {
        document_id: DocumentId,
        update: String,
    },
}

impl ClientFrame {
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientFrame::JoinDocument { .. } => "join-document",
            ClientFrame::LeaveDocument { .. } => "leave-document",
            ClientFrame::CrdtUpdate { .. } => "crdt-update",
            ClientFrame::AwarenessUpdate { .. } => "awareness-update",
        }
    }
}

/// A collaborator as shown to other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub principal_id: PrincipalId,
    pub display_name: String,
}

/// Frames emitted to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected {
        message: String,
        socket_id: SocketId,
    },
    #[serde(rename_all = "camelCase")]
    UsersInDocument { users: Vec<PresenceUser> },
    #[serde(rename_all = "camelCase")]
    UserJoined { user: PresenceUser },
    #[serde(rename_all = "camelCase")]
    UserLeft { user: PresenceUser },
    #[serde(rename_all = "camelCase")]
    CrdtUpdate {
        document_id: DocumentId,
        update: String,
    },
    #[serde(rename_all = "camelCase")]
    AwarenessUpdate {
        document_id: DocumentId,
        update: String,
    },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("server frame serializes")
    }
}

/// A bus envelope rendered as a client frame: the originator tag stays on
/// the bus, the payload passes through as-is.
pub fn relay_frame(kind: BroadcastKind, data: &JsonValue) -> String {
    serde_json::json!({ "type": kind, "data": data }).to_string()
}
