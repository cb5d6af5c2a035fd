use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::debug;

use crate::models::HealthResponse;
use crate::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
        active_sessions: state.registry.session_count().await,
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Readiness check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Service is ready".to_string(),
        active_sessions: state.registry.session_count().await,
    })
}
