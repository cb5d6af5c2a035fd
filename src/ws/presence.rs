//! Live connections, presence events and presenter arbitration.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::connctx::{ConnectionHandle, DisconnectReason};
use super::router::{DiagramActor, Presenter};
use crate::models::{ServerMessage, UserRef, REASON_INSUFFICIENT_PERMISSIONS, REASON_NOT_HOST};

/// `session_ended` reason when the host's last socket goes away
pub const REASON_HOST_DISCONNECTED: &str = "host_disconnected";

impl DiagramActor {
    fn user_is_live(&self, user_id: &str) -> bool {
        self.conns.values().any(|c| c.user.user_id == user_id)
    }

    /// Bind a new socket. The snapshot is always its first frame.
    pub(super) async fn attach(&mut self, conn: ConnectionHandle) {
        let conn_id = conn.conn_id;
        let user = conn.user.clone();
        let role = conn.role;
        let first_for_user = !self.user_is_live(&user.user_id);

        self.conns.insert(conn_id, conn);
        {
            let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            *meta.live.entry(user.user_id.clone()).or_insert(0) += 1;
            meta.touch();
        }
        info!(diagram = %self.key, conn = %conn_id, user = %user.user_id, role = %role, "connection attached");

        let sync = self.state_sync();
        self.send_to(conn_id, sync).await;

        if first_for_user {
            let joined = ServerMessage::ParticipantJoined { user, role, timestamp: Utc::now() };
            self.broadcast(joined, None).await;
        }

        if let Some(presenter) = &self.presenter {
            let current = ServerMessage::CurrentPresenter {
                current_presenter: Some(presenter.user.clone()),
                initiating_user: presenter.user.clone(),
            };
            self.send_to(conn_id, current).await;
        }
    }

    /// Drop a socket from the session. Ends the session when it was the
    /// host's last one.
    pub(super) async fn detach(&mut self, conn_id: Uuid, reason: DisconnectReason) {
        let Some(conn) = self.conns.remove(&conn_id) else { return };
        conn.close(reason);
        self.lagging.retain(|id| *id != conn_id);
        {
            let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = meta.live.get_mut(&conn.user.user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    meta.live.remove(&conn.user.user_id);
                }
            }
            meta.touch();
        }
        info!(diagram = %self.key, conn = %conn_id, user = %conn.user.user_id, ?reason, "connection detached");

        if self.presenter.as_ref().is_some_and(|p| p.conn_id == conn_id) {
            self.set_presenter(None, conn.user.clone()).await;
        }

        if self.user_is_live(&conn.user.user_id) {
            return;
        }
        let left = ServerMessage::ParticipantLeft { user: conn.user.clone(), timestamp: Utc::now() };
        self.broadcast(left, None).await;

        if conn.user.user_id == self.host_user_id && self.ending.is_none() {
            self.ending = Some(REASON_HOST_DISCONNECTED.to_string());
        }
    }

    async fn set_presenter(&mut self, presenter: Option<Presenter>, initiating_user: UserRef) {
        let current = presenter.as_ref().map(|p| p.user.clone());
        {
            let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            meta.current_presenter = current.clone();
        }
        self.presenter = presenter;
        info!(
            diagram = %self.key,
            presenter = current.as_ref().map(|u| u.user_id.as_str()).unwrap_or("none"),
            "presenter changed"
        );
        self.broadcast(ServerMessage::CurrentPresenter { current_presenter: current, initiating_user }, None)
            .await;
    }

    /// Grant presenter to the requesting connection, replacing any holder
    pub(super) async fn presenter_request(&mut self, conn_id: Uuid) {
        let Some(conn) = self.conns.get(&conn_id) else { return };
        let user = conn.user.clone();
        if !conn.role.can_write() {
            self.send_to(conn_id, ServerMessage::authorization_denied(None, REASON_INSUFFICIENT_PERMISSIONS))
                .await;
            return;
        }
        self.set_presenter(Some(Presenter { conn_id, user: user.clone() }), user).await;
    }

    /// Host-only handoff of presenter status to a live writer, or clearing it
    pub(super) async fn change_presenter(&mut self, conn_id: Uuid, new_presenter: Option<String>) {
        let Some(conn) = self.conns.get(&conn_id) else { return };
        let host = conn.user.clone();
        if host.user_id != self.host_user_id {
            self.send_to(conn_id, ServerMessage::authorization_denied(None, REASON_NOT_HOST)).await;
            return;
        }

        let Some(target_id) = new_presenter else {
            self.set_presenter(None, host).await;
            return;
        };
        let target = self
            .conns
            .values()
            .filter(|c| c.user.user_id == target_id && c.role.can_write())
            .max_by_key(|c| c.conn_id == conn_id)
            .map(|c| Presenter { conn_id: c.conn_id, user: c.user.clone() });

        match target {
            Some(presenter) => self.set_presenter(Some(presenter), host).await,
            None => {
                let err = ServerMessage::error(
                    "invalid_presenter",
                    format!("user '{}' is not connected with write access", target_id),
                );
                self.send_to(conn_id, err).await;
            }
        }
    }

    /// Forward a cursor or selection frame from the presenter to everyone
    /// else. Frames from any other connection are dropped without reply.
    pub(super) async fn relay_presenter(&mut self, conn_id: Uuid, frame: impl FnOnce(UserRef) -> ServerMessage) {
        let Some(presenter) = self.presenter.as_ref().filter(|p| p.conn_id == conn_id) else {
            debug!(diagram = %self.key, conn = %conn_id, "presenter frame from non-presenter dropped");
            return;
        };
        let msg = frame(presenter.user.clone());
        self.broadcast(msg, Some(conn_id)).await;
    }
}
