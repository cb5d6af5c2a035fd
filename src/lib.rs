pub mod auth;
pub mod config;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod ws;

use axum::http::HeaderValue;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use config::Config;
use db::DiagramStore;
use docs::ApiDoc;
use routes::create_api_routes;
use ws::SessionRegistry;

/// Shared state handed to every handler
pub struct AppState {
    pub config: Config,
    pub registry: SessionRegistry,
    pub store: Arc<dyn DiagramStore>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn DiagramStore>) -> Arc<Self> {
        let registry = SessionRegistry::new(store.clone(), config.collab_settings());
        Arc::new(Self { config, registry, store })
    }
}

/// Assemble the full HTTP application
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);
    let app = Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(state))
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()));

    let app = match cors {
        Some(cors) => app.layer(cors),
        None => app,
    };
    app.layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .as_deref()?
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any))
}
