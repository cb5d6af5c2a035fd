use axum::{
    extract::{ws::WebSocketUpgrade, Extension, Path, State},
    http::StatusCode,
    response::Response,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::auth::authorize_connection;
use crate::models::{api_error, ApiError, DiagramKey};
use crate::services::auth_service::Identity;
use crate::ws::gateway::serve_connection;
use crate::AppState;

/// WebSocket handler for a diagram's collaboration session.
///
/// The caller must have joined the session over REST first; the roster role
/// becomes the connection's role.
pub async fn collab_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, ApiError> {
    let key = DiagramKey::new(threat_model_id, diagram_id);
    info!(diagram = %key, user = %identity.user_id(), "New WebSocket connection attempt");

    let session = state
        .registry
        .get(&key)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No collaboration session for diagram '{}'", key)))?;

    let role = authorize_connection(&identity, &session.roster()).map_err(|e| {
        warn!(diagram = %key, "WebSocket rejected: {}", e);
        api_error(StatusCode::FORBIDDEN, e.to_string())
    })?;

    let settings = state.registry.settings().clone();
    let user = identity.user;
    Ok(ws.on_upgrade(move |socket| serve_connection(socket, session, user, role, settings)))
}
