use axum::{extract::{Extension, State}, http::StatusCode, Json};
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::auth::auth;
use crate::models::{ApiError, DiagnosticsResponse};
use crate::services::auth_service::Identity;
use crate::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Session and process level diagnostics, admin only
pub async fn diagnostics(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), ApiError> {

    auth::ensure_admin(&identity.prpls)?;

    // Aggregate diagnostics from the registry
    let mut n_sessions: u32 = 0;
    let mut n_conn: u32 = 0;
    let mut n_roster: u32 = 0;
    let mut n_presenting: u32 = 0;
    for session in state.registry.list().await {
        n_sessions += 1;
        n_conn += session.live_connections() as u32;
        n_roster += session.roster().len() as u32;
        if session.has_presenter() {
            n_presenting += 1;
        }
    }

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Sessions: {}, Conn: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_sessions,
        n_conn
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_sessions,
            n_conn,
            n_roster,
            n_presenting,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
