//! Local fan-out plumbing.
//!
//! Two structures that must never be conflated with the distributed
//! presence map: the socket registry (this instance's `socketId →
//! connection` index, the only way to reach a local client) and the topic
//! subscriptions (one bus subscription per document for as long as any
//! local socket is joined to it).
//!
//! Local fan-out is fed by the bus, not by the presence map: every inbound
//! envelope goes to each local socket joined to the topic except the one
//! whose id matches the envelope's originator tag.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use cowrite_core::bus::DocumentBus;
use cowrite_core::ids::{DocumentId, PrincipalId, SocketId};

use crate::auth::Principal;
use crate::state::HubMetrics;
use crate::ws::protocol::relay_frame;

/// One live local connection: who it is, how to reach its writer task, and
/// which document it currently has joined.
pub struct ConnectionHandle {
    pub principal_id: PrincipalId,
    pub display_name: String,
    sender: mpsc::Sender<String>,
    joined: RwLock<Option<DocumentId>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new(principal: &Principal, sender: mpsc::Sender<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            principal_id: principal.principal_id.clone(),
            display_name: principal.display_name.clone(),
            sender,
            joined: RwLock::new(None),
            closed: AtomicBool::new(false),
            shutdown,
        }
    }

    /// First caller wins; disconnect and shutdown drain may both attempt
    /// the same tear-down.
    pub fn begin_cleanup(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Tear-down has run (or is running) for this connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the connection's tasks to wind down: the read loop stops and the
    /// writer flushes a close frame. Safe to call any number of times, from
    /// any task.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// A receiver that resolves once [`shutdown`](Self::shutdown) fires,
    /// even if it fired before the subscription.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn joined(&self) -> Option<DocumentId> {
        self.joined.read().expect("joined lock poisoned").clone()
    }

    pub fn set_joined(&self, document_id: Option<DocumentId>) {
        *self.joined.write().expect("joined lock poisoned") = document_id;
    }

    /// Hand a frame to the writer task without waiting. A full buffer means
    /// the client is not draining; the frame is dropped and the connection
    /// stays up.
    pub fn try_send(&self, frame: String) -> bool {
        self.sender.try_send(frame).is_ok()
    }
}

#[derive(Default)]
pub struct SocketRegistry {
    inner: DashMap<SocketId, Arc<ConnectionHandle>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, socket_id: SocketId, handle: Arc<ConnectionHandle>) {
        self.inner.insert(socket_id, handle);
    }

    pub fn unregister(&self, socket_id: &SocketId) -> Option<Arc<ConnectionHandle>> {
        self.inner.remove(socket_id).map(|(_, handle)| handle)
    }

    pub fn get(&self, socket_id: &SocketId) -> Option<Arc<ConnectionHandle>> {
        self.inner.get(socket_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Detach every socket at once; used by the shutdown drain.
    pub fn drain_all(&self) -> Vec<(SocketId, Arc<ConnectionHandle>)> {
        let sockets: Vec<SocketId> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        sockets
            .into_iter()
            .filter_map(|socket_id| {
                self.inner
                    .remove(&socket_id)
                    .map(|(socket_id, handle)| (socket_id, handle))
            })
            .collect()
    }

    /// Send a frame directly to one socket.
    pub fn send_to(&self, socket_id: &SocketId, frame: String, metrics: &HubMetrics) -> bool {
        let Some(handle) = self.get(socket_id) else {
            return false;
        };
        let sent = handle.try_send(frame);
        if !sent {
            metrics.inc_dropped();
            debug!(socket_id = %socket_id, "outbound buffer full; frame dropped");
        }
        sent
    }

    /// Fan a frame out to every local socket joined to `document_id`,
    /// suppressing the originator by socket id (a principal with two
    /// devices must still see the other device's frames).
    pub fn fan_out(
        &self,
        document_id: &DocumentId,
        origin: &SocketId,
        frame: &str,
        metrics: &HubMetrics,
    ) {
        for entry in self.inner.iter() {
            if entry.key() == origin {
                continue;
            }
            if entry.value().joined().as_ref() != Some(document_id) {
                continue;
            }
            if entry.value().try_send(frame.to_owned()) {
                metrics.inc_relayed();
            } else {
                metrics.inc_dropped();
                debug!(
                    socket_id = %entry.key(),
                    document_id = %document_id,
                    "outbound buffer full; relay frame dropped"
                );
            }
        }
    }
}

struct TopicState {
    local_sessions: usize,
    task: JoinHandle<()>,
}

/// Per-document bus subscriptions, refcounted by local sessions.
///
/// The instance subscribes when its first local socket joins a document and
/// unsubscribes (by aborting the relay task, which drops the subscription)
/// when the last one departs.
pub struct TopicSubscriptions {
    bus: DocumentBus,
    sockets: Arc<SocketRegistry>,
    metrics: Arc<HubMetrics>,
    topics: DashMap<DocumentId, TopicState>,
}

impl TopicSubscriptions {
    pub fn new(bus: DocumentBus, sockets: Arc<SocketRegistry>, metrics: Arc<HubMetrics>) -> Self {
        Self {
            bus,
            sockets,
            metrics,
            topics: DashMap::new(),
        }
    }

    /// Account one more local session on the document, subscribing to its
    /// topic if this is the first.
    pub async fn ensure_subscribed(&self, document_id: &DocumentId) -> Result<()> {
        if let Some(mut state) = self.topics.get_mut(document_id) {
            state.local_sessions += 1;
            return Ok(());
        }

        // Subscribe before taking the entry; the await must not happen
        // under the map lock.
        let mut subscription = self.bus.subscribe(document_id).await?;

        match self.topics.entry(document_id.clone()) {
            Entry::Occupied(mut occupied) => {
                // Another join raced us; their relay task is already up and
                // the redundant subscription drops here.
                occupied.get_mut().local_sessions += 1;
            }
            Entry::Vacant(vacant) => {
                let sockets = self.sockets.clone();
                let metrics = self.metrics.clone();
                let document_id = document_id.clone();
                let task = tokio::spawn(async move {
                    while let Some(envelope) = subscription.recv().await {
                        let frame = relay_frame(envelope.kind, &envelope.data);
                        sockets.fan_out(&document_id, &envelope.origin, &frame, &metrics);
                    }
                });
                vacant.insert(TopicState {
                    local_sessions: 1,
                    task,
                });
            }
        }
        Ok(())
    }

    /// Account one local session departing; unsubscribes on the last.
    pub fn release(&self, document_id: &DocumentId) {
        if let Some(mut state) = self.topics.get_mut(document_id) {
            state.local_sessions = state.local_sessions.saturating_sub(1);
        }
        if let Some((_, state)) = self
            .topics
            .remove_if(document_id, |_, state| state.local_sessions == 0)
        {
            state.task.abort();
            debug!(document_id = %document_id, "unsubscribed from document topic");
        }
    }

    pub fn is_subscribed(&self, document_id: &DocumentId) -> bool {
        self.topics.contains_key(document_id)
    }

    pub fn subscribed_documents(&self) -> Vec<DocumentId> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::bus::{BroadcastKind, BusEnvelope};
    use cowrite_core::cache::MemoryCache;
    use serde_json::json;
    use std::time::Duration;

    fn principal(id: &str) -> Principal {
        Principal {
            principal_id: PrincipalId::from(id),
            display_name: id.to_uppercase(),
        }
    }

    fn attach(
        registry: &SocketRegistry,
        socket: &str,
        who: &str,
        joined: Option<&str>,
        capacity: usize,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(ConnectionHandle::new(&principal(who), tx));
        handle.set_joined(joined.map(DocumentId::from));
        registry.register(SocketId::from(socket), handle);
        rx
    }

    #[tokio::test]
    async fn shutdown_lever_wakes_subscribers_and_cleanup_runs_once() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(&principal("p"), tx);

        let mut signal = handle.shutdown_signal();
        handle.shutdown();
        signal.wait_for(|stop| *stop).await.unwrap();

        // A receiver taken after the fact still observes the shutdown.
        let mut late = handle.shutdown_signal();
        late.wait_for(|stop| *stop).await.unwrap();

        assert!(!handle.is_closed());
        assert!(handle.begin_cleanup());
        assert!(handle.is_closed());
        assert!(!handle.begin_cleanup());
    }

    #[tokio::test]
    async fn fan_out_suppresses_the_originator_only() {
        let registry = SocketRegistry::new();
        let metrics = HubMetrics::default();
        let doc = DocumentId::from("D1");

        let mut origin_rx = attach(&registry, "s1", "alice", Some("D1"), 8);
        let mut peer_rx = attach(&registry, "s2", "bob", Some("D1"), 8);
        let mut outsider_rx = attach(&registry, "s3", "carol", Some("D2"), 8);

        registry.fan_out(&doc, &SocketId::from("s1"), "frame", &metrics);

        assert_eq!(peer_rx.try_recv().unwrap(), "frame");
        assert!(origin_rx.try_recv().is_err());
        assert!(outsider_rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().relayed_frames, 1);
    }

    #[tokio::test]
    async fn full_buffers_drop_frames_without_severing() {
        let registry = SocketRegistry::new();
        let metrics = HubMetrics::default();
        let doc = DocumentId::from("D1");

        let mut rx = attach(&registry, "s2", "bob", Some("D1"), 1);
        registry.fan_out(&doc, &SocketId::from("s1"), "first", &metrics);
        registry.fan_out(&doc, &SocketId::from("s1"), "second", &metrics);

        assert_eq!(rx.try_recv().unwrap(), "first");
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.relayed_frames, 1);
        assert_eq!(snapshot.dropped_frames, 1);
        // The socket is still registered.
        assert!(registry.get(&SocketId::from("s2")).is_some());
    }

    #[tokio::test]
    async fn subscription_refcount_follows_local_sessions() {
        let cache = Arc::new(MemoryCache::new());
        let bus = DocumentBus::new(cache);
        let registry = Arc::new(SocketRegistry::new());
        let metrics = Arc::new(HubMetrics::default());
        let topics = TopicSubscriptions::new(bus.clone(), registry, metrics);
        let doc = DocumentId::from("D1");

        topics.ensure_subscribed(&doc).await.unwrap();
        topics.ensure_subscribed(&doc).await.unwrap();
        assert!(topics.is_subscribed(&doc));

        topics.release(&doc);
        assert!(topics.is_subscribed(&doc));
        topics.release(&doc);
        assert!(!topics.is_subscribed(&doc));
        assert!(topics.subscribed_documents().is_empty());
    }

    #[tokio::test]
    async fn relay_task_forwards_bus_envelopes_to_local_sockets() {
        let cache = Arc::new(MemoryCache::new());
        let bus = DocumentBus::new(cache);
        let registry = Arc::new(SocketRegistry::new());
        let metrics = Arc::new(HubMetrics::default());
        let topics = TopicSubscriptions::new(bus.clone(), registry.clone(), metrics);
        let doc = DocumentId::from("D1");

        let mut rx = attach(&registry, "s2", "bob", Some("D1"), 8);
        topics.ensure_subscribed(&doc).await.unwrap();

        let envelope = BusEnvelope::new(
            BroadcastKind::CrdtUpdate,
            SocketId::from("s1"),
            json!({"documentId": "D1", "update": "AAEC"}),
        );
        bus.publish(&doc, &envelope).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "crdt-update");
        assert_eq!(value["data"]["update"], "AAEC");
    }
}
