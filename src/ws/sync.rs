//! Snapshot, correction and resync traffic of a diagram actor.

use tracing::debug;
use uuid::Uuid;

use super::router::DiagramActor;
use crate::models::ServerMessage;

/// How a client is told to refetch after `resync_request`
pub const RESYNC_METHOD: &str = "rest_api";

impl DiagramActor {
    pub(super) fn state_sync(&self) -> ServerMessage {
        ServerMessage::DiagramStateSync {
            diagram_id: self.key.diagram_id,
            update_vector: self.state.update_vector(),
            cells: self.state.cells(),
        }
    }

    /// Full authoritative state for one connection whose view diverged
    pub(super) async fn send_correction(&mut self, conn_id: Uuid, operation_id: Option<String>) {
        let correction = ServerMessage::StateCorrection {
            operation_id,
            update_vector: self.state.update_vector(),
            cells: self.state.cells(),
        };
        self.send_to(conn_id, correction).await;
    }

    /// Point the client at the REST model endpoint instead of pushing cells
    pub(super) async fn resync_request(&mut self, conn_id: Uuid) {
        debug!(diagram = %self.key, conn = %conn_id, "resync requested");
        let response = ServerMessage::ResyncResponse {
            threat_model_id: self.key.threat_model_id,
            diagram_id: self.key.diagram_id,
            method: RESYNC_METHOD.to_string(),
            update_vector: self.state.update_vector(),
        };
        self.send_to(conn_id, response).await;
    }

    pub(super) async fn sync_status(&mut self, conn_id: Uuid) {
        let status = ServerMessage::SyncStatusResponse { update_vector: self.state.update_vector() };
        self.send_to(conn_id, status).await;
    }

    /// Push a fresh snapshot to everyone, used when the actor cannot vouch
    /// for what clients hold
    pub(super) async fn force_resync_all(&mut self) {
        let sync = self.state_sync();
        self.broadcast(sync, None).await;
    }
}
