//! WebSocket gateway.
//!
//! Connection lifecycle: the upgrade is refused outright without a valid
//! bearer token in the `?token=` query parameter; an authenticated socket
//! may join one document at a time, and only `crdt-update`,
//! `awareness-update`, and `leave-document` are meaningful while joined.
//! Nothing short of an authentication failure (or process shutdown) tears a
//! connection down: protocol violations, rate-limit rejections, and store
//! hiccups all answer with an `error` frame and keep the socket open.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cowrite_core::bus::{BroadcastKind, BusEnvelope};
use cowrite_core::ids::{DocumentId, SocketId};

use crate::auth::Principal;
use crate::error::AppError;
use crate::state::AppState;
use crate::ws::protocol::{ClientFrame, PresenceUser, ServerFrame};
use crate::ws::relay::ConnectionHandle;

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

/// `GET /ws?token=…` — authenticate, then upgrade.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = query.token.as_deref() else {
        return AppError::unauthorized("missing token query parameter").into_response();
    };
    let principal = match state.signer.verify(token.trim()) {
        Ok(principal) => principal,
        Err(error) => return AppError::unauthorized(error.to_string()).into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

async fn handle_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let socket_id = SocketId::generate();
    let (sender, mut outbound) = mpsc::channel::<String>(state.config.outbound_buffer);
    let handle = Arc::new(ConnectionHandle::new(&principal, sender));
    state.sockets.register(socket_id.clone(), handle.clone());
    state.metrics.inc_connections();
    info!(
        socket_id = %socket_id,
        principal_id = %principal.principal_id,
        "realtime connection established"
    );

    let (mut sink, mut stream) = socket.split();
    let mut writer_stop = handle.shutdown_signal();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = writer_stop.changed() => {
                    if *writer_stop.borrow() {
                        break;
                    }
                }
            }
        }
        // Normal closure, whether the hub shut the connection down or the
        // read side wound it up.
        let _ = sink.send(Message::Close(None)).await;
    });

    send_frame(
        &state,
        &socket_id,
        &ServerFrame::Connected {
            message: "connected to cowrite hub".to_owned(),
            socket_id: socket_id.clone(),
        },
    );

    let mut reader_stop = handle.shutdown_signal();
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = reader_stop.wait_for(|stop| *stop) => break,
        };
        let Some(message) = message else { break };
        match message {
            Ok(Message::Text(text)) => {
                dispatch_frame(&state, &socket_id, &handle, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                send_frame(
                    &state,
                    &socket_id,
                    &ServerFrame::error("binary frames are not supported"),
                );
            }
            Ok(Message::Close(_)) => break,
            // Ping/pong is handled underneath the frame layer.
            Ok(_) => {}
            Err(error) => {
                debug!(socket_id = %socket_id, %error, "websocket read error");
                break;
            }
        }
    }

    // Stop the writer on the client-initiated path too, then let it flush
    // its close frame before the task ends.
    handle.shutdown();
    cleanup_connection(&state, &socket_id, &handle).await;
    if let Err(error) = writer.await {
        debug!(socket_id = %socket_id, %error, "writer task ended abnormally");
    }
    info!(
        socket_id = %socket_id,
        principal_id = %handle.principal_id,
        "realtime connection closed"
    );
}

/// Route one inbound frame. Processing is strictly in arrival order per
/// connection; the caller awaits each dispatch before reading the next
/// frame.
pub(crate) async fn dispatch_frame(
    state: &AppState,
    socket_id: &SocketId,
    handle: &Arc<ConnectionHandle>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(socket_id = %socket_id, %error, "unparseable inbound frame");
            send_frame(state, socket_id, &ServerFrame::error("unrecognized message"));
            return;
        }
    };

    match frame {
        ClientFrame::JoinDocument { document_id } => {
            join_document(state, socket_id, handle, document_id).await;
        }
        ClientFrame::LeaveDocument { document_id } => {
            if handle.joined().as_ref() == Some(&document_id) {
                leave_document(state, socket_id, handle, &document_id).await;
            } else {
                send_frame(
                    state,
                    socket_id,
                    &ServerFrame::error(format!("not joined to document {document_id}")),
                );
            }
        }
        ClientFrame::CrdtUpdate {
            document_id,
            update,
        } => {
            relay_update(
                state,
                socket_id,
                handle,
                document_id,
                update,
                BroadcastKind::CrdtUpdate,
            )
            .await;
        }
        ClientFrame::AwarenessUpdate {
            document_id,
            update,
        } => {
            relay_update(
                state,
                socket_id,
                handle,
                document_id,
                update,
                BroadcastKind::AwarenessUpdate,
            )
            .await;
        }
    }
}

async fn join_document(
    state: &AppState,
    socket_id: &SocketId,
    handle: &Arc<ConnectionHandle>,
    document_id: DocumentId,
) {
    // A socket holds one document at a time; joining performs the previous
    // document's cleanup first (also the path for a same-document rejoin).
    if let Some(current) = handle.joined() {
        leave_document(state, socket_id, handle, &current).await;
    }

    if let Err(error) = state
        .presence
        .add_session(
            &document_id,
            &handle.principal_id,
            &handle.display_name,
            socket_id,
            None,
        )
        .await
    {
        warn!(
            socket_id = %socket_id,
            document_id = %document_id,
            %error,
            "presence write failed on join"
        );
        send_frame(
            state,
            socket_id,
            &ServerFrame::error("temporarily unable to join document"),
        );
        return;
    }
    handle.set_joined(Some(document_id.clone()));

    if let Err(error) = state.topics.ensure_subscribed(&document_id).await {
        // Degraded: presence is written but this instance will not relay
        // until a later join repairs the subscription.
        warn!(
            document_id = %document_id,
            %error,
            "topic subscription failed on join"
        );
    }

    let user = PresenceUser {
        principal_id: handle.principal_id.clone(),
        display_name: handle.display_name.clone(),
    };
    let envelope = BusEnvelope::new(
        BroadcastKind::UserJoined,
        socket_id.clone(),
        json!({ "user": user }),
    );
    if let Err(error) = state.bus.publish(&document_id, &envelope).await {
        warn!(document_id = %document_id, %error, "failed to publish user-joined");
    }

    let users = match state.presence.list_sessions(&document_id).await {
        Ok(sessions) => sessions
            .into_iter()
            .map(|session| PresenceUser {
                principal_id: session.principal_id,
                display_name: session.display_name,
            })
            .collect(),
        Err(error) => {
            warn!(document_id = %document_id, %error, "failed to list sessions for joiner");
            vec![user]
        }
    };
    send_frame(state, socket_id, &ServerFrame::UsersInDocument { users });
    debug!(
        socket_id = %socket_id,
        document_id = %document_id,
        "joined document"
    );
}

async fn leave_document(
    state: &AppState,
    socket_id: &SocketId,
    handle: &Arc<ConnectionHandle>,
    document_id: &DocumentId,
) {
    // Only the session's current owner removes it: if a newer join from the
    // same principal superseded this socket, the field belongs to the newer
    // session and this departure must not disturb it.
    let owns_session = match state
        .presence
        .get_session(document_id, &handle.principal_id)
        .await
    {
        Ok(Some(session)) => session.socket_id == *socket_id,
        Ok(None) => false,
        Err(error) => {
            warn!(
                document_id = %document_id,
                %error,
                "presence read failed on leave; leaving session for the sweeper"
            );
            false
        }
    };

    if owns_session {
        if let Err(error) = state
            .presence
            .remove_session(document_id, &handle.principal_id)
            .await
        {
            warn!(document_id = %document_id, %error, "presence removal failed on leave");
        }
        let user = PresenceUser {
            principal_id: handle.principal_id.clone(),
            display_name: handle.display_name.clone(),
        };
        let envelope = BusEnvelope::new(
            BroadcastKind::UserLeft,
            socket_id.clone(),
            json!({ "user": user }),
        );
        if let Err(error) = state.bus.publish(document_id, &envelope).await {
            warn!(document_id = %document_id, %error, "failed to publish user-left");
        }
    }

    handle.set_joined(None);
    state.topics.release(document_id);
    debug!(
        socket_id = %socket_id,
        document_id = %document_id,
        "left document"
    );
}

async fn relay_update(
    state: &AppState,
    socket_id: &SocketId,
    handle: &Arc<ConnectionHandle>,
    document_id: DocumentId,
    update: String,
    kind: BroadcastKind,
) {
    if handle.joined().as_ref() != Some(&document_id) {
        send_frame(
            state,
            socket_id,
            &ServerFrame::error(format!(
                "join document {document_id} before sending updates"
            )),
        );
        return;
    }

    let decision = state
        .limiter
        .check_and_admit(&handle.principal_id, kind.as_str())
        .await;
    if !decision.admitted {
        state.metrics.inc_rate_limited();
        send_frame(
            state,
            socket_id,
            &ServerFrame::error(format!(
                "rate limit exceeded for {}; retry after {}",
                kind.as_str(),
                decision.reset_at
            )),
        );
        return;
    }

    let envelope = BusEnvelope::new(
        kind,
        socket_id.clone(),
        json!({ "documentId": document_id, "update": update }),
    );
    if let Err(error) = state.bus.publish(&document_id, &envelope).await {
        warn!(document_id = %document_id, %error, "failed to publish update");
        send_frame(
            state,
            socket_id,
            &ServerFrame::error("temporarily unable to broadcast"),
        );
        return;
    }

    // Activity keeps the session (and its hash TTL) alive; awareness
    // deltas additionally land in the session's cursor blob, where
    // last-writer-wins per principal is exactly right.
    let refresh = match kind {
        BroadcastKind::AwarenessUpdate => {
            state
                .presence
                .update_cursor(&document_id, &handle.principal_id, json!({ "update": update }))
                .await
        }
        _ => state.presence.touch(&document_id, &handle.principal_id).await,
    };
    if let Err(error) = refresh {
        debug!(document_id = %document_id, %error, "presence refresh failed");
    }
}

/// Tear-down shared by disconnect and shutdown drain; idempotent so the
/// two paths can race.
pub(crate) async fn cleanup_connection(
    state: &AppState,
    socket_id: &SocketId,
    handle: &Arc<ConnectionHandle>,
) {
    if !handle.begin_cleanup() {
        return;
    }
    if let Some(document_id) = handle.joined() {
        leave_document(state, socket_id, handle, &document_id).await;
    }
    state.sockets.unregister(socket_id);
    state.metrics.dec_connections();
}

pub(crate) fn send_frame(state: &AppState, socket_id: &SocketId, frame: &ServerFrame) {
    state
        .sockets
        .send_to(socket_id, frame.encode(), &state.metrics);
}
