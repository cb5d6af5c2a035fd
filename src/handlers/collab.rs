use axum::{
    extract::{Extension, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::auth;
use crate::models::{
    api_error, ApiError, DiagramKey, DiagramSnapshot, SessionConflictResponse, SessionListResponse, SessionResponse,
};
use crate::services::auth_service::Identity;
use crate::ws::RegistryError;
use crate::AppState;

/// Where a client should open the collaboration socket for `key`
pub fn websocket_url(state: &AppState, headers: &HeaderMap, key: &DiagramKey) -> String {
    let path = format!("/api/v1/threat_models/{}/diagrams/{}/ws", key.threat_model_id, key.diagram_id);
    if let Some(base) = &state.config.public_ws_base {
        return format!("{}{}", base.trim_end_matches('/'), path);
    }
    match headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("ws://{}{}", host, path),
        None => path,
    }
}

fn registry_error(e: RegistryError) -> ApiError {
    match e {
        RegistryError::NotFound(_) | RegistryError::DiagramNotFound(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        RegistryError::AlreadyExists { .. } => api_error(StatusCode::CONFLICT, e.to_string()),
        RegistryError::NotParticipant(_) => api_error(StatusCode::FORBIDDEN, e.to_string()),
        RegistryError::Store(store_err) => {
            error!("Diagram store failure: {}", store_err);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Diagram store unavailable")
        }
    }
}

/// Start a collaboration session, the caller becomes its host
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionResponse>), Response> {
    let role = auth::ensure_threat_model_role(&identity.prpls, threat_model_id).map_err(IntoResponse::into_response)?;
    let key = DiagramKey::new(threat_model_id, diagram_id);
    let url = websocket_url(&state, &headers, &key);

    match state.registry.create_session(key, identity.user.clone(), role).await {
        Ok(session) => Ok((StatusCode::CREATED, Json(session.view(url)))),
        Err(RegistryError::AlreadyExists { session_id }) => {
            info!(diagram = %key, "Session already exists, returning join reference");
            Err((
                StatusCode::CONFLICT,
                Json(SessionConflictResponse {
                    code: StatusCode::CONFLICT.as_u16(),
                    error: "A collaboration session already exists for this diagram".to_string(),
                    session_id,
                    websocket_url: url,
                }),
            )
                .into_response())
        }
        Err(e) => Err(registry_error(e).into_response()),
    }
}

/// Join the running session on a diagram
pub async fn join_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let role = auth::ensure_threat_model_role(&identity.prpls, threat_model_id)?;
    let key = DiagramKey::new(threat_model_id, diagram_id);

    let session = state
        .registry
        .join_session(&key, identity.user.clone(), role)
        .await
        .map_err(registry_error)?;
    Ok((StatusCode::OK, Json(session.view(websocket_url(&state, &headers, &key)))))
}

pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    auth::ensure_threat_model_role(&identity.prpls, threat_model_id)?;
    let key = DiagramKey::new(threat_model_id, diagram_id);

    let session = state
        .registry
        .get(&key)
        .await
        .ok_or_else(|| registry_error(RegistryError::NotFound(key)))?;
    Ok((StatusCode::OK, Json(session.view(websocket_url(&state, &headers, &key)))))
}

/// Leave the session. Idempotent: leaving a session you are not in is fine.
pub async fn leave_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let key = DiagramKey::new(threat_model_id, diagram_id);

    match state.registry.leave_session(&key, identity.user_id()).await {
        Ok(()) | Err(RegistryError::NotFound(_)) | Err(RegistryError::NotParticipant(_)) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(registry_error(e)),
    }
}

/// Sessions on threat models the caller can see
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionListResponse>), ApiError> {
    let sessions = state
        .registry
        .list()
        .await
        .into_iter()
        .filter(|s| auth::role_for_threat_model(&identity.prpls, s.key.threat_model_id).is_some())
        .map(|s| s.view(websocket_url(&state, &headers, &s.key)))
        .collect();
    Ok((StatusCode::OK, Json(SessionListResponse { sessions })))
}

/// Canonical cells of a diagram, the refetch path after `resync_response`
/// or `history_operation`.
///
/// While a session is live the answer comes from its actor, so the version
/// always matches what has been broadcast.
pub async fn diagram_model(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<(StatusCode, Json<DiagramSnapshot>), ApiError> {
    auth::ensure_threat_model_role(&identity.prpls, threat_model_id)?;
    let key = DiagramKey::new(threat_model_id, diagram_id);

    if let Some(session) = state.registry.get(&key).await {
        if let Ok(snapshot) = session.handle().snapshot().await {
            return Ok((StatusCode::OK, Json(snapshot)));
        }
    }

    match state.store.load(&key).await {
        Ok(Some(snapshot)) => Ok((StatusCode::OK, Json(snapshot))),
        Ok(None) => Err(registry_error(RegistryError::DiagramNotFound(key))),
        Err(e) => Err(registry_error(RegistryError::Store(e))),
    }
}
