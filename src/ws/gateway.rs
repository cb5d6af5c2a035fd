use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connctx::{connection_channel, ConnectionHandle, ConnectionOutbox, DisconnectReason, Outgoing};
use super::registry::CollaborationSession;
use super::router::DiagramHandle;
use crate::config::CollabSettings;
use crate::models::{ClientMessage, Role, UserRef};

/// Drive one authorized socket until it closes.
///
/// The socket is split into a writer task fed by the connection's queues
/// and a read loop that forwards parsed frames to the diagram actor.
pub async fn serve_connection(
    socket: WebSocket,
    session: Arc<CollaborationSession>,
    user: UserRef,
    role: Role,
    settings: CollabSettings,
) {
    let (conn, outbox) = connection_channel(user, role, &settings);
    let conn_id = conn.conn_id;
    let cancel = outbox.cancel.clone();
    let handle = session.handle().clone();
    let (sink, stream) = socket.split();

    info!(session = %session.session_id, conn = %conn_id, user = %conn.user.user_id, "WebSocket connection established");

    let writer = tokio::spawn(write_loop(sink, outbox, settings.heartbeat_interval));
    if handle.attach(conn.clone()).await.is_err() {
        warn!(session = %session.session_id, "session ended before the connection could attach");
        conn.close(DisconnectReason::SessionEnded);
        let _ = writer.await;
        return;
    }

    let reason = read_loop(stream, &conn, &handle, &cancel, &settings).await;
    if handle.detach(conn_id, reason).await.is_err() {
        debug!(conn = %conn_id, "session already gone on detach");
    }
    conn.close(reason);
    if let Err(e) = writer.await {
        error!(conn = %conn_id, "writer task failed: {}", e);
    }
    info!(session = %session.session_id, conn = %conn_id, ?reason, "WebSocket connection terminated");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    conn: &ConnectionHandle,
    handle: &DiagramHandle,
    cancel: &CancellationToken,
    settings: &CollabSettings,
) -> DisconnectReason {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                return conn.close_reason().unwrap_or(DisconnectReason::Error);
            }
            next = tokio::time::timeout(settings.idle_timeout, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                info!(conn = %conn.conn_id, "no traffic within {:?}, closing", settings.idle_timeout);
                return DisconnectReason::IdleTimeout;
            }
            Ok(None) => return DisconnectReason::Closed,
            Ok(Some(Err(e))) => {
                debug!(conn = %conn.conn_id, "socket error: {}", e);
                return DisconnectReason::Error;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(parsed) => {
                    debug!(conn = %conn.conn_id, message_type = parsed.message_type(), "frame received");
                    if handle.inbound(conn.conn_id, parsed).await.is_err() {
                        return DisconnectReason::SessionEnded;
                    }
                }
                Err(e) => {
                    warn!(conn = %conn.conn_id, "unparseable frame: {}", e);
                    if handle.reject(conn.conn_id, format!("invalid message: {}", e)).await.is_err() {
                        return DisconnectReason::SessionEnded;
                    }
                }
            },
            Message::Binary(_) => {
                if handle.reject(conn.conn_id, "binary frames are not supported".to_string()).await.is_err() {
                    return DisconnectReason::SessionEnded;
                }
            }
            Message::Close(_) => return DisconnectReason::Closed,
            // pongs only keep the idle timer alive, pings are answered by axum
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbox: ConnectionOutbox, heartbeat: Duration) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;
    let mut critical_sent = false;

    loop {
        let batch = tokio::select! {
            batch = outbox.next(critical_sent) => batch,
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    outbox.cancel.cancel();
                    return;
                }
                continue;
            }
        };

        for item in batch {
            match item {
                Outgoing::Frame(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to serialize {} frame: {}", msg.message_type(), e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        outbox.cancel.cancel();
                        return;
                    }
                    if !msg.is_lossy() {
                        critical_sent = true;
                    }
                }
                Outgoing::Close(reason) => {
                    let (code, why) = reason.close_frame();
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: why.into() })))
                        .await;
                    return;
                }
            }
        }
    }
}
