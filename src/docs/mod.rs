use utoipa::OpenApi;
use uuid::Uuid;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Start a collaboration session on a diagram
#[utoipa::path(
    post,
    path = "/api/v1/threat_models/{threat_model_id}/diagrams/{diagram_id}/collaborate",
    params(
        ("threat_model_id" = Uuid, Path, description = "Threat model id"),
        ("diagram_id" = Uuid, Path, description = "Diagram id")
    ),
    responses(
        (status = 201, description = "Session created, caller is host", body = SessionResponse),
        (status = 403, description = "No role on the threat model", body = ErrorResponse),
        (status = 404, description = "Diagram not found", body = ErrorResponse),
        (status = 409, description = "Session already exists", body = SessionConflictResponse)
    )
)]
#[allow(dead_code)]
pub async fn create_session_doc() {}

/// Join the running session on a diagram
#[utoipa::path(
    put,
    path = "/api/v1/threat_models/{threat_model_id}/diagrams/{diagram_id}/collaborate",
    params(
        ("threat_model_id" = Uuid, Path, description = "Threat model id"),
        ("diagram_id" = Uuid, Path, description = "Diagram id")
    ),
    responses(
        (status = 200, description = "Joined", body = SessionResponse),
        (status = 404, description = "No session", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn join_session_doc() {}

/// Session status
#[utoipa::path(
    get,
    path = "/api/v1/threat_models/{threat_model_id}/diagrams/{diagram_id}/collaborate",
    params(
        ("threat_model_id" = Uuid, Path, description = "Threat model id"),
        ("diagram_id" = Uuid, Path, description = "Diagram id")
    ),
    responses(
        (status = 200, description = "Session", body = SessionResponse),
        (status = 404, description = "No session", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn session_status_doc() {}

/// Leave a session; the host leaving ends it
#[utoipa::path(
    delete,
    path = "/api/v1/threat_models/{threat_model_id}/diagrams/{diagram_id}/collaborate",
    params(
        ("threat_model_id" = Uuid, Path, description = "Threat model id"),
        ("diagram_id" = Uuid, Path, description = "Diagram id")
    ),
    responses(
        (status = 204, description = "Left")
    )
)]
#[allow(dead_code)]
pub async fn leave_session_doc() {}

/// Canonical diagram cells
#[utoipa::path(
    get,
    path = "/api/v1/threat_models/{threat_model_id}/diagrams/{diagram_id}/model",
    params(
        ("threat_model_id" = Uuid, Path, description = "Threat model id"),
        ("diagram_id" = Uuid, Path, description = "Diagram id")
    ),
    responses(
        (status = 200, description = "Diagram snapshot", body = DiagramSnapshot),
        (status = 404, description = "Diagram not found", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagram_model_doc() {}

/// Sessions visible to the caller
#[utoipa::path(
    get,
    path = "/api/v1/collaboration/sessions",
    responses(
        (status = 200, description = "Sessions", body = SessionListResponse)
    )
)]
#[allow(dead_code)]
pub async fn list_sessions_doc() {}

/// Diagnostics, admin only
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics", body = DiagnosticsResponse),
        (status = 403, description = "Not an admin", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        create_session_doc,
        join_session_doc,
        session_status_doc,
        leave_session_doc,
        diagram_model_doc,
        list_sessions_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            DiagnosticsResponse,
            SessionResponse,
            SessionConflictResponse,
            SessionListResponse,
            ParticipantView,
            UserRef,
            Role,
            DiagramSnapshot,
            Cell,
            Geometry,
            CellOperation,
            CellOperationKind,
            CellPatchOperation,
        )
    ),
    tags(
        (name = "collaboration", description = "Diagram collaboration sessions")
    )
)]
pub struct ApiDoc;
