//! Undo and redo, delegated to the store and answered with a forced resync.

use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::persist::PersistJob;
use super::router::DiagramActor;
use crate::db::HistoryOutcome;
use crate::models::{Cell, HistoryKind, HistoryMessage, ServerMessage, REASON_INSUFFICIENT_PERMISSIONS};

/// The undo/redo the actor is waiting on
#[derive(Debug, Clone)]
pub(super) struct PendingHistory {
    pub seq: u64,
    pub conn_id: Uuid,
    pub kind: HistoryKind,
    pub deadline: Instant,
}

fn history_failed(detail: &str) -> ServerMessage {
    ServerMessage::error("history_failed", format!("undo/redo could not be completed: {}", detail))
}

impl DiagramActor {
    /// Queue the history step behind every mutation already accepted, so the
    /// store undoes what clients have actually seen.
    pub(super) async fn request_history(&mut self, conn_id: Uuid, kind: HistoryKind) {
        let Some(conn) = self.conns.get(&conn_id) else { return };
        if !conn.role.can_write() {
            self.send_to(conn_id, ServerMessage::authorization_denied(None, REASON_INSUFFICIENT_PERMISSIONS))
                .await;
            return;
        }

        self.history_seq += 1;
        let seq = self.history_seq;
        if !self.persist(PersistJob::History { kind, conn_id, seq }) {
            self.send_to(conn_id, history_failed("diagram store unavailable")).await;
            return;
        }
        info!(diagram = %self.key, conn = %conn_id, ?kind, seq, "history step requested");
        self.history = Some(PendingHistory {
            seq,
            conn_id,
            kind,
            deadline: Instant::now() + self.settings.history_timeout,
        });
    }

    pub(super) async fn history_completed(
        &mut self,
        seq: u64,
        conn_id: Uuid,
        kind: HistoryKind,
        result: Result<HistoryOutcome, String>,
    ) {
        if !self.history.as_ref().is_some_and(|h| h.seq == seq) {
            // abandoned at its deadline, but the store may still have moved
            if let Ok(HistoryOutcome::Applied(cells)) = result {
                warn!(diagram = %self.key, ?kind, seq, "late history step landed, resyncing");
                self.apply_history(kind, cells).await;
            }
            return;
        }
        self.history = None;

        match result {
            Ok(HistoryOutcome::Applied(cells)) => self.apply_history(kind, cells).await,
            Ok(HistoryOutcome::Empty) => {
                let message = match kind {
                    HistoryKind::Undo => HistoryMessage::NoOperationsToUndo,
                    HistoryKind::Redo => HistoryMessage::NoOperationsToRedo,
                };
                let msg = ServerMessage::HistoryOperation {
                    operation_type: kind,
                    message,
                    update_vector: self.state.update_vector(),
                };
                self.send_to(conn_id, msg).await;
            }
            Ok(HistoryOutcome::Unsupported) => {
                let err = ServerMessage::error("history_unavailable", "this diagram store keeps no history");
                self.send_to(conn_id, err).await;
            }
            Err(e) => {
                error!(diagram = %self.key, ?kind, "history step failed: {}", e);
                self.send_to(conn_id, history_failed("the diagram store reported an error")).await;
                self.force_resync_all().await;
            }
        }

        self.replay_parked().await;
    }

    /// The store did not answer in time. Release parked traffic and make
    /// every client resync, since the step may still land later.
    pub(super) async fn history_timed_out(&mut self) {
        let Some(pending) = self.history.take() else { return };
        warn!(
            diagram = %self.key,
            kind = ?pending.kind,
            seq = pending.seq,
            parked = self.parked.len(),
            "history step timed out"
        );
        self.send_to(pending.conn_id, history_failed("timed out waiting for the diagram store")).await;
        self.force_resync_all().await;
        self.replay_parked().await;
    }

    async fn apply_history(&mut self, kind: HistoryKind, cells: Vec<Cell>) {
        let update_vector = self.state.replace_cells(cells);
        // store history does not move the version, align it
        self.flush();
        info!(diagram = %self.key, ?kind, update_vector, "history step applied");
        let msg = ServerMessage::HistoryOperation {
            operation_type: kind,
            message: HistoryMessage::ResyncRequired,
            update_vector,
        };
        self.broadcast(msg, None).await;
    }

    /// Run frames that arrived while the history step was in flight
    async fn replay_parked(&mut self) {
        while self.history.is_none() {
            let Some((conn_id, message)) = self.parked.pop_front() else { break };
            self.dispatch(conn_id, message).await;
        }
    }
}
