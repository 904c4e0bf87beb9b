//! Shared fixtures for the in-crate behavioral tests.
//!
//! Tests drive the gateway through the same dispatch path real connections
//! use, with a channel standing in for the socket writer. Building several
//! states over one shared cache yields a multi-instance cluster inside one
//! process.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;

use cowrite_core::HubConfig;
use cowrite_core::cache::{MemoryCache, SharedCache};
use cowrite_core::documents::{DocumentGateway, MemoryDocumentGateway};
use cowrite_core::ids::{PrincipalId, SocketId};

use crate::auth::Principal;
use crate::state::{AppState, build_state_with};
use crate::ws::connection::{cleanup_connection, dispatch_frame};
use crate::ws::relay::ConnectionHandle;

pub(crate) fn test_config() -> HubConfig {
    HubConfig {
        outbound_buffer: 32,
        ..HubConfig::default()
    }
}

pub(crate) fn memory_state() -> (AppState, Arc<MemoryDocumentGateway>) {
    memory_state_with_config(test_config())
}

pub(crate) fn memory_state_with_config(
    config: HubConfig,
) -> (AppState, Arc<MemoryDocumentGateway>) {
    let documents = Arc::new(MemoryDocumentGateway::new());
    let state = build_state_with(
        config,
        Arc::new(MemoryCache::new()),
        documents.clone() as Arc<dyn DocumentGateway>,
    );
    (state, documents)
}

/// `instances` hub states sharing one cache store and one document gateway,
/// i.e. one cluster.
pub(crate) fn memory_cluster(
    config: HubConfig,
    instances: usize,
) -> (Vec<AppState>, Arc<MemoryDocumentGateway>) {
    let cache: SharedCache = Arc::new(MemoryCache::new());
    let documents = Arc::new(MemoryDocumentGateway::new());
    let states = (0..instances)
        .map(|_| {
            build_state_with(
                config.clone(),
                cache.clone(),
                documents.clone() as Arc<dyn DocumentGateway>,
            )
        })
        .collect();
    (states, documents)
}

pub(crate) struct TestClient {
    pub socket_id: SocketId,
    pub handle: Arc<ConnectionHandle>,
    pub rx: mpsc::Receiver<String>,
}

/// Attach a virtual socket to an instance, as the upgrade path would.
pub(crate) fn connect(state: &AppState, principal_id: &str, display_name: &str) -> TestClient {
    let principal = Principal {
        principal_id: PrincipalId::from(principal_id),
        display_name: display_name.to_owned(),
    };
    let socket_id = SocketId::generate();
    let (tx, rx) = mpsc::channel(state.config.outbound_buffer);
    let handle = Arc::new(ConnectionHandle::new(&principal, tx));
    state.sockets.register(socket_id.clone(), handle.clone());
    state.metrics.inc_connections();
    TestClient {
        socket_id,
        handle,
        rx,
    }
}

impl TestClient {
    pub async fn send(&self, state: &AppState, frame: JsonValue) {
        dispatch_frame(state, &self.socket_id, &self.handle, &frame.to_string()).await;
    }

    pub async fn join(&self, state: &AppState, document_id: &str) {
        self.send(
            state,
            json!({"type": "join-document", "data": {"documentId": document_id}}),
        )
        .await;
    }

    pub async fn leave(&self, state: &AppState, document_id: &str) {
        self.send(
            state,
            json!({"type": "leave-document", "data": {"documentId": document_id}}),
        )
        .await;
    }

    pub async fn crdt_update(&self, state: &AppState, document_id: &str, update: &str) {
        self.send(
            state,
            json!({"type": "crdt-update", "data": {"documentId": document_id, "update": update}}),
        )
        .await;
    }

    pub async fn awareness_update(&self, state: &AppState, document_id: &str, update: &str) {
        self.send(
            state,
            json!({"type": "awareness-update", "data": {"documentId": document_id, "update": update}}),
        )
        .await;
    }

    /// Next outbound frame, parsed; panics after one second of silence.
    pub async fn next_frame(&mut self) -> JsonValue {
        let frame = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("expected a frame within one second")
            .expect("socket channel closed");
        serde_json::from_str(&frame).expect("outbound frames are JSON")
    }

    /// Next frame, asserting its type tag.
    pub async fn expect_frame(&mut self, frame_type: &str) -> JsonValue {
        let frame = self.next_frame().await;
        assert_eq!(
            frame["type"], frame_type,
            "unexpected frame: {frame}"
        );
        frame
    }

    /// Assert no frame arrives for `window`.
    pub async fn assert_silent(&mut self, window: Duration) {
        tokio::time::sleep(window).await;
        if let Ok(frame) = self.rx.try_recv() {
            panic!("expected silence, received: {frame}");
        }
    }

    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub async fn disconnect(&self, state: &AppState) {
        cleanup_connection(state, &self.socket_id, &self.handle).await;
    }
}
