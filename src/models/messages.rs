use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Cell, CellPatchOperation, Role, UserRef};

/// Reason sent in `authorization_denied` when the role is too low
pub const REASON_INSUFFICIENT_PERMISSIONS: &str = "insufficient_permissions";
/// Reason sent in `authorization_denied` for host-only requests
pub const REASON_NOT_HOST: &str = "not_host";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Frames a client may send over the collaboration socket
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ClientMessage {
    DiagramOperation {
        operation_id: String,
        operation: CellPatchOperation,
    },
    PresenterRequest,
    /// Host hands presenter status to `new_presenter` (a user id), or clears it
    ChangePresenter {
        #[serde(default)]
        new_presenter: Option<String>,
    },
    PresenterCursor {
        cursor_position: CursorPosition,
    },
    PresenterSelection {
        selected_cells: Vec<String>,
    },
    ResyncRequest,
    SyncStatusRequest,
    UndoRequest,
    RedoRequest,
}

impl ClientMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::DiagramOperation { .. } => "diagram_operation",
            ClientMessage::PresenterRequest => "presenter_request",
            ClientMessage::ChangePresenter { .. } => "change_presenter",
            ClientMessage::PresenterCursor { .. } => "presenter_cursor",
            ClientMessage::PresenterSelection { .. } => "presenter_selection",
            ClientMessage::ResyncRequest => "resync_request",
            ClientMessage::SyncStatusRequest => "sync_status_request",
            ClientMessage::UndoRequest => "undo_request",
            ClientMessage::RedoRequest => "redo_request",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    ValidationFailed,
    InvalidOperationType,
    EmptyOperation,
    ConflictDetected,
    NoStateChange,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Undo,
    Redo,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMessage {
    ResyncRequired,
    NoOperationsToUndo,
    NoOperationsToRedo,
}

/// Frames the server sends over the collaboration socket
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerMessage {
    DiagramStateSync {
        diagram_id: Uuid,
        update_vector: u64,
        cells: Vec<Cell>,
    },
    DiagramOperation {
        operation_id: String,
        user: UserRef,
        update_vector: u64,
        operation: CellPatchOperation,
    },
    StateCorrection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
        update_vector: u64,
        cells: Vec<Cell>,
    },
    OperationRejected {
        operation_id: String,
        reason: RejectionReason,
        message: String,
        update_vector: u64,
        requires_resync: bool,
    },
    ResyncResponse {
        threat_model_id: Uuid,
        diagram_id: Uuid,
        method: String,
        update_vector: u64,
    },
    SyncStatusResponse {
        update_vector: u64,
    },
    AuthorizationDenied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_operation_id: Option<String>,
        reason: String,
    },
    CurrentPresenter {
        current_presenter: Option<UserRef>,
        initiating_user: UserRef,
    },
    PresenterCursor {
        user: UserRef,
        cursor_position: CursorPosition,
    },
    PresenterSelection {
        user: UserRef,
        selected_cells: Vec<String>,
    },
    HistoryOperation {
        operation_type: HistoryKind,
        message: HistoryMessage,
        update_vector: u64,
    },
    ParticipantJoined {
        user: UserRef,
        role: Role,
        timestamp: DateTime<Utc>,
    },
    ParticipantLeft {
        user: UserRef,
        timestamp: DateTime<Utc>,
    },
    SessionEnded {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn error(error: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn session_ended(reason: impl Into<String>) -> Self {
        ServerMessage::SessionEnded { reason: reason.into(), timestamp: Utc::now() }
    }

    pub fn authorization_denied(original_operation_id: Option<String>, reason: &str) -> Self {
        ServerMessage::AuthorizationDenied { original_operation_id, reason: reason.to_string() }
    }

    /// High frequency presenter frames that may be dropped under backpressure
    pub fn is_lossy(&self) -> bool {
        matches!(self, ServerMessage::PresenterCursor { .. } | ServerMessage::PresenterSelection { .. })
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::DiagramStateSync { .. } => "diagram_state_sync",
            ServerMessage::DiagramOperation { .. } => "diagram_operation",
            ServerMessage::StateCorrection { .. } => "state_correction",
            ServerMessage::OperationRejected { .. } => "operation_rejected",
            ServerMessage::ResyncResponse { .. } => "resync_response",
            ServerMessage::SyncStatusResponse { .. } => "sync_status_response",
            ServerMessage::AuthorizationDenied { .. } => "authorization_denied",
            ServerMessage::CurrentPresenter { .. } => "current_presenter",
            ServerMessage::PresenterCursor { .. } => "presenter_cursor",
            ServerMessage::PresenterSelection { .. } => "presenter_selection",
            ServerMessage::HistoryOperation { .. } => "history_operation",
            ServerMessage::ParticipantJoined { .. } => "participant_joined",
            ServerMessage::ParticipantLeft { .. } => "participant_left",
            ServerMessage::SessionEnded { .. } => "session_ended",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CellOperationKind, Geometry};
    use serde_json::json;

    #[test]
    fn parses_diagram_operation_frame() {
        let raw = json!({
            "message_type": "diagram_operation",
            "operation_id": "op-1",
            "operation": {
                "type": "patch",
                "cells": [{
                    "id": "c1",
                    "operation": "add",
                    "data": {
                        "id": "c1",
                        "shape": "process",
                        "geometry": {"x": 100.0, "y": 100.0, "width": 80.0, "height": 60.0}
                    }
                }]
            }
        });

        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::DiagramOperation { operation_id, operation } => {
                assert_eq!(operation_id, "op-1");
                assert_eq!(operation.kind, "patch");
                assert_eq!(operation.cells[0].operation, CellOperationKind::Add);
                let cell = operation.cells[0].data.as_ref().unwrap();
                assert_eq!(cell.geometry, Geometry { x: 100.0, y: 100.0, width: 80.0, height: 60.0 });
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn unit_requests_ignore_extra_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"message_type":"undo_request","initiating_user":{"user_id":"alice"}}"#,
        )
        .unwrap();
        assert_eq!(msg, ClientMessage::UndoRequest);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let res = serde_json::from_str::<ClientMessage>(r#"{"message_type":"teleport"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn cleared_presenter_serializes_as_null() {
        let msg = ServerMessage::CurrentPresenter {
            current_presenter: None,
            initiating_user: UserRef::new("alice"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["message_type"], "current_presenter");
        assert!(value["current_presenter"].is_null());
    }

    #[test]
    fn history_operation_uses_snake_case_values() {
        let msg = ServerMessage::HistoryOperation {
            operation_type: HistoryKind::Undo,
            message: HistoryMessage::NoOperationsToUndo,
            update_vector: 3,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["operation_type"], "undo");
        assert_eq!(value["message"], "no_operations_to_undo");
    }
}
