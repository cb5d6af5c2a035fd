use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CollabSettings;
use crate::models::{Role, ServerMessage, UserRef};

/// Why a connection left its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    Error,
    IdleTimeout,
    /// Outbound queue stayed full, the client must resync
    Lagging,
    /// Participant was removed from the roster
    Removed,
    SessionEnded,
}

impl DisconnectReason {
    /// WebSocket close code and reason sent when the server closes the socket
    pub fn close_frame(self) -> (u16, &'static str) {
        match self {
            DisconnectReason::Lagging => (4000, "resync_required"),
            DisconnectReason::Removed => (4003, "removed_from_session"),
            DisconnectReason::SessionEnded => (1000, "session_ended"),
            DisconnectReason::IdleTimeout => (1001, "idle_timeout"),
            DisconnectReason::Closed | DisconnectReason::Error => (1000, "closed"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The writer went away
    Closed,
    /// Queue still full after the retry budget
    Lagging,
}

struct Shared {
    /// Presenter cursor frames, drop-oldest
    lossy: Mutex<VecDeque<ServerMessage>>,
    lossy_capacity: usize,
    /// Newest presenter selection only; cursor bursts cannot evict it
    selection: Mutex<Option<ServerMessage>>,
    lossy_ready: Notify,
    close: OnceLock<DisconnectReason>,
}

impl Shared {
    fn push_lossy(&self, msg: ServerMessage) {
        if matches!(msg, ServerMessage::PresenterSelection { .. }) {
            *self.selection.lock().unwrap_or_else(|e| e.into_inner()) = Some(msg);
            self.lossy_ready.notify_one();
            return;
        }
        let mut queue = self.lossy.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.lossy_capacity {
            queue.pop_front();
        }
        queue.push_back(msg);
        drop(queue);
        self.lossy_ready.notify_one();
    }

    fn drain_lossy(&self) -> Vec<ServerMessage> {
        let mut out: Vec<ServerMessage> = {
            let mut queue = self.lossy.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        out.extend(self.selection.lock().unwrap_or_else(|e| e.into_inner()).take());
        out
    }
}

/// The actor's side of one live socket
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub user: UserRef,
    pub role: Role,
    tx: mpsc::Sender<ServerMessage>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("conn_id", &self.conn_id)
            .field("user", &self.user.user_id)
            .field("role", &self.role)
            .finish()
    }
}

/// The writer's side of one live socket
pub struct ConnectionOutbox {
    rx: mpsc::Receiver<ServerMessage>,
    shared: Arc<Shared>,
    pub cancel: CancellationToken,
}

pub fn connection_channel(user: UserRef, role: Role, settings: &CollabSettings) -> (ConnectionHandle, ConnectionOutbox) {
    let (tx, rx) = mpsc::channel(settings.outbound_queue_size);
    let shared = Arc::new(Shared {
        lossy: Mutex::new(VecDeque::with_capacity(settings.cursor_buffer_size)),
        lossy_capacity: settings.cursor_buffer_size,
        selection: Mutex::new(None),
        lossy_ready: Notify::new(),
        close: OnceLock::new(),
    });
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle {
        conn_id: Uuid::new_v4(),
        user,
        role,
        tx,
        shared: shared.clone(),
        cancel: cancel.clone(),
    };
    (handle, ConnectionOutbox { rx, shared, cancel })
}

impl ConnectionHandle {
    /// Queue a frame for the writer.
    ///
    /// Presenter cursor frames go to the drop-oldest buffer and the newest
    /// selection to its own slot; neither ever fails. Everything else must be delivered: a full queue is retried
    /// `retries` times before the connection is reported as lagging.
    pub async fn send(&self, msg: ServerMessage, retries: u32) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        if msg.is_lossy() {
            self.shared.push_lossy(msg);
            return Ok(());
        }

        let mut msg = msg;
        let mut attempt = 0;
        loop {
            match self.tx.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(SendError::Closed),
                Err(TrySendError::Full(returned)) => {
                    if attempt >= retries {
                        return Err(SendError::Lagging);
                    }
                    attempt += 1;
                    msg = returned;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Ask the writer to close the socket. The first reason wins.
    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.shared.close.set(reason);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.shared.close.get().copied()
    }
}

/// What the writer should do next
#[derive(Debug)]
pub enum Outgoing {
    Frame(ServerMessage),
    Close(DisconnectReason),
}

impl ConnectionOutbox {
    /// Wait for the next frame to write.
    ///
    /// Buffered presenter frames are held back until `critical_sent`, which
    /// keeps the snapshot the first frame a client sees.
    pub async fn next(&mut self, critical_sent: bool) -> Vec<Outgoing> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let reason = self.close_reason();
                let mut out = Vec::new();
                // a lagging client resyncs anyway, everyone else gets what was queued
                if reason != DisconnectReason::Lagging {
                    while let Ok(msg) = self.rx.try_recv() {
                        out.push(Outgoing::Frame(msg));
                    }
                }
                out.push(Outgoing::Close(reason));
                out
            }
            msg = self.rx.recv() => match msg {
                Some(msg) => vec![Outgoing::Frame(msg)],
                None => vec![Outgoing::Close(self.close_reason())],
            },
            _ = self.shared.lossy_ready.notified(), if critical_sent => {
                self.shared.drain_lossy().into_iter().map(Outgoing::Frame).collect()
            }
        }
    }

    pub fn close_reason(&self) -> DisconnectReason {
        self.shared.close.get().copied().unwrap_or(DisconnectReason::SessionEnded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CursorPosition;

    fn settings(queue: usize, ring: usize) -> CollabSettings {
        CollabSettings { outbound_queue_size: queue, cursor_buffer_size: ring, ..CollabSettings::default() }
    }

    fn cursor(x: f64) -> ServerMessage {
        ServerMessage::PresenterCursor { user: UserRef::new("p"), cursor_position: CursorPosition { x, y: 0.0 } }
    }

    #[tokio::test]
    async fn full_queue_reports_lagging_after_retries() {
        let (handle, _outbox) = connection_channel(UserRef::new("u"), Role::Writer, &settings(1, 4));
        handle.send(ServerMessage::SyncStatusResponse { update_vector: 1 }, 3).await.unwrap();
        let res = handle.send(ServerMessage::SyncStatusResponse { update_vector: 2 }, 3).await;
        assert_eq!(res, Err(SendError::Lagging));
    }

    #[tokio::test]
    async fn lossy_ring_drops_oldest_and_waits_for_first_frame() {
        let (handle, mut outbox) = connection_channel(UserRef::new("u"), Role::Writer, &settings(8, 2));
        for x in 0..4 {
            handle.send(cursor(x as f64), 0).await.unwrap();
        }
        handle.send(ServerMessage::SyncStatusResponse { update_vector: 0 }, 0).await.unwrap();

        // cursor frames are not eligible before the first critical frame
        let first = outbox.next(false).await;
        assert!(matches!(first.as_slice(), [Outgoing::Frame(ServerMessage::SyncStatusResponse { .. })]));

        let rest = outbox.next(true).await;
        let xs: Vec<f64> = rest
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Frame(ServerMessage::PresenterCursor { cursor_position, .. }) => Some(cursor_position.x),
                _ => None,
            })
            .collect();
        assert_eq!(xs, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn close_reason_reaches_writer() {
        let (handle, mut outbox) = connection_channel(UserRef::new("u"), Role::Reader, &settings(8, 2));
        handle.send(ServerMessage::SyncStatusResponse { update_vector: 0 }, 0).await.unwrap();
        handle.close(DisconnectReason::Lagging);
        handle.close(DisconnectReason::Closed);
        assert!(matches!(outbox.next(true).await.as_slice(), [Outgoing::Close(DisconnectReason::Lagging)]));
        assert_eq!(DisconnectReason::Lagging.close_frame(), (4000, "resync_required"));
        assert_eq!(handle.send(ServerMessage::SyncStatusResponse { update_vector: 0 }, 0).await, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn queued_frames_are_flushed_before_close() {
        let (handle, mut outbox) = connection_channel(UserRef::new("u"), Role::Reader, &settings(8, 2));
        handle.send(ServerMessage::session_ended("host_left"), 0).await.unwrap();
        handle.close(DisconnectReason::SessionEnded);
        let out = outbox.next(true).await;
        assert!(matches!(
            out.as_slice(),
            [Outgoing::Frame(ServerMessage::SessionEnded { .. }), Outgoing::Close(DisconnectReason::SessionEnded)]
        ));
    }

    #[tokio::test]
    async fn cursor_burst_does_not_evict_latest_selection() {
        let (handle, mut outbox) = connection_channel(UserRef::new("u"), Role::Writer, &settings(8, 2));
        let selection = |cells: &[&str]| ServerMessage::PresenterSelection {
            user: UserRef::new("p"),
            selected_cells: cells.iter().map(|c| c.to_string()).collect(),
        };
        handle.send(selection(&["c1"]), 0).await.unwrap();
        handle.send(selection(&["c1", "c2"]), 0).await.unwrap();
        for x in 0..10 {
            handle.send(cursor(x as f64), 0).await.unwrap();
        }

        let out = outbox.next(true).await;
        let selections: Vec<Vec<String>> = out
            .iter()
            .filter_map(|o| match o {
                Outgoing::Frame(ServerMessage::PresenterSelection { selected_cells, .. }) => Some(selected_cells.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(selections, vec![vec!["c1".to_string(), "c2".to_string()]]);
        let cursors = out
            .iter()
            .filter(|o| matches!(o, Outgoing::Frame(ServerMessage::PresenterCursor { .. })))
            .count();
        assert_eq!(cursors, 2);
    }

    #[test]
    fn idle_timeout_closes_with_going_away() {
        assert_eq!(DisconnectReason::IdleTimeout.close_frame(), (1001, "idle_timeout"));
    }
}
