use axum::{
    middleware,
    routing::get,
    Router,
};
use std::sync::Arc;

use crate::handlers::{
    collab_ws, create_session, diagnostics, diagram_model, health_check, join_session, leave_session, list_sessions,
    ready_check, session_status,
};
use crate::routes::auth_middleware::auth_middleware;
use crate::AppState;

/// Create API routes
pub fn create_api_routes(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/collaboration/sessions", get(list_sessions))
        .route(
            "/v1/threat_models/:threat_model_id/diagrams/:diagram_id/collaborate",
            get(session_status).post(create_session).put(join_session).delete(leave_session),
        )
        .route("/v1/threat_models/:threat_model_id/diagrams/:diagram_id/model", get(diagram_model))
        .route("/v1/threat_models/:threat_model_id/diagrams/:diagram_id/ws", get(collab_ws))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)); // Applies to all routes added above

    Router::new()
        .route("/v1/health", get(health_check))
        .route("/v1/ready", get(ready_check))
        .merge(protected)
        .with_state(state)
}
