use diagram_colab::config::Config;
use diagram_colab::db::{DiagramStore, MemoryDiagramStore, PgDiagramStore};
use diagram_colab::{build_app, AppState};
use std::panic;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "diagram_colab=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    if config.auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - every authenticated request will be rejected");
    }

    let store = open_store(&config).await;
    let state = AppState::new(config.clone(), store);

    let sweeper_cancel = CancellationToken::new();
    let sweeper = state.registry.spawn_sweeper(sweeper_cancel.clone());

    let app = build_app(state.clone());

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 WebSocket available at ws://{}/api/v1/threat_models/{{tm}}/diagrams/{{d}}/ws", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!("Server error: {}", e);
    }

    info!("Shutting down, ending all collaboration sessions");
    sweeper_cancel.cancel();
    let _ = sweeper.await;
    state.registry.shutdown_all("server_shutdown").await;
}

async fn open_store(config: &Config) -> Arc<dyn DiagramStore> {
    if let Some(db_url) = &config.db_url {
        match PgDiagramStore::connect(db_url).await {
            Ok(store) => {
                if let Err(e) = store.ensure_schema().await {
                    error!("Failed to prepare diagram tables: {}", e);
                }
                info!("Database initialized successfully");
                return Arc::new(store);
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Falling back to the in-memory diagram store");
            }
        }
    } else {
        warn!("No database URL configured - diagrams live in memory only");
    }

    if config.is_development() {
        Arc::new(MemoryDiagramStore::autocreate())
    } else {
        Arc::new(MemoryDiagramStore::new())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
