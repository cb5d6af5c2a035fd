use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// Permission level a participant holds on a threat model.
/// Ordered so that `Owner > Writer > Reader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
    Owner,
}

impl Role {
    pub fn can_write(self) -> bool {
        matches!(self, Role::Writer | Role::Owner)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reader" => Some(Role::Reader),
            "writer" => Some(Role::Writer),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
            Role::Owner => write!(f, "owner"),
        }
    }
}

/// Identity of a user as carried in messages and session views
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserRef {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl UserRef {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), email: None, display_name: None }
    }
}

/// Key of a collaboration session: one session per diagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagramKey {
    pub threat_model_id: Uuid,
    pub diagram_id: Uuid,
}

impl DiagramKey {
    pub fn new(threat_model_id: Uuid, diagram_id: Uuid) -> Self {
        Self { threat_model_id, diagram_id }
    }
}

impl fmt::Display for DiagramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.threat_model_id, self.diagram_id)
    }
}

/// Roster entry for a REST-authorized participant
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub user: UserRef,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ParticipantView {
    pub user: UserRef,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Whether the participant currently holds at least one live socket
    pub connected: bool,
}

/// Collaboration session as returned by the REST endpoints
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub threat_model_id: Uuid,
    pub diagram_id: Uuid,
    pub host: UserRef,
    pub current_presenter: Option<UserRef>,
    pub participants: Vec<ParticipantView>,
    pub websocket_url: String,
}

/// Body of a 409 returned when a session already exists for the diagram
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionConflictResponse {
    pub code: u16,
    pub error: String,
    pub session_id: Uuid,
    pub websocket_url: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionResponse>,
}
