use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// HS256 secret used to validate bearer tokens
    pub auth_jwt_secret: Option<String>,

    /// Database URL. Without it diagrams live in memory only.
    pub db_url: Option<String>,

    /// Absolute base for websocket URLs handed out by the REST endpoints,
    /// e.g. `wss://collab.example.com`. Derived from the Host header when unset.
    pub public_ws_base: Option<String>,

    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    #[serde(default = "default_persist_max_retries")]
    pub persist_max_retries: u32,

    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,

    #[serde(default = "default_persist_backoff_max_ms")]
    pub persist_backoff_max_ms: u64,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,

    #[serde(default = "default_cursor_buffer_size")]
    pub cursor_buffer_size: usize,

    #[serde(default = "default_mutation_send_retries")]
    pub mutation_send_retries: u32,

    #[serde(default = "default_actor_mailbox_size")]
    pub actor_mailbox_size: usize,

    /// How long an undo/redo may wait on the store before it is abandoned
    #[serde(default = "default_history_timeout_ms")]
    pub history_timeout_ms: u64,

    #[serde(default = "default_max_parked_frames")]
    pub max_parked_frames: usize,

    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,

    #[serde(default = "default_session_sweep_interval_secs")]
    pub session_sweep_interval_secs: u64,
}

/// Tunables of the collaboration engine, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct CollabSettings {
    pub dedup_window: Duration,
    pub persist_max_retries: u32,
    pub persist_backoff: Duration,
    pub persist_backoff_max: Duration,
    pub flush_interval: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_queue_size: usize,
    pub cursor_buffer_size: usize,
    pub mutation_send_retries: u32,
    pub actor_mailbox_size: usize,
    pub history_timeout: Duration,
    pub max_parked_frames: usize,
    pub session_idle_timeout: Duration,
    pub session_sweep_interval: Duration,
}

impl Default for CollabSettings {
    fn default() -> Self {
        Config::default().collab_settings()
    }
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn collab_settings(&self) -> CollabSettings {
        CollabSettings {
            dedup_window: Duration::from_secs(self.dedup_window_secs),
            persist_max_retries: self.persist_max_retries,
            persist_backoff: Duration::from_millis(self.persist_backoff_ms),
            persist_backoff_max: Duration::from_millis(self.persist_backoff_max_ms),
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            outbound_queue_size: self.outbound_queue_size.max(1),
            cursor_buffer_size: self.cursor_buffer_size.max(1),
            mutation_send_retries: self.mutation_send_retries,
            actor_mailbox_size: self.actor_mailbox_size.max(1),
            history_timeout: Duration::from_millis(self.history_timeout_ms.max(1)),
            max_parked_frames: self.max_parked_frames,
            session_idle_timeout: Duration::from_secs(self.session_idle_timeout_secs),
            session_sweep_interval: Duration::from_secs(self.session_sweep_interval_secs.max(1)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            cors_origins: None,
            log_level: default_log_level(),
            service_name: default_service_name(),
            auth_jwt_secret: None,
            db_url: None,
            public_ws_base: None,
            dedup_window_secs: default_dedup_window_secs(),
            persist_max_retries: default_persist_max_retries(),
            persist_backoff_ms: default_persist_backoff_ms(),
            persist_backoff_max_ms: default_persist_backoff_max_ms(),
            flush_interval_secs: default_flush_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            outbound_queue_size: default_outbound_queue_size(),
            cursor_buffer_size: default_cursor_buffer_size(),
            mutation_send_retries: default_mutation_send_retries(),
            actor_mailbox_size: default_actor_mailbox_size(),
            history_timeout_ms: default_history_timeout_ms(),
            max_parked_frames: default_max_parked_frames(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            session_sweep_interval_secs: default_session_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "diagram-colab".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_dedup_window_secs() -> u64 {
    30
}

fn default_persist_max_retries() -> u32 {
    5
}

fn default_persist_backoff_ms() -> u64 {
    200
}

fn default_persist_backoff_max_ms() -> u64 {
    5_000
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_outbound_queue_size() -> usize {
    256
}

fn default_cursor_buffer_size() -> usize {
    16
}

fn default_mutation_send_retries() -> u32 {
    3
}

fn default_actor_mailbox_size() -> usize {
    1024
}

fn default_history_timeout_ms() -> u64 {
    5_000
}

fn default_max_parked_frames() -> usize {
    256
}

fn default_session_idle_timeout_secs() -> u64 {
    15 * 60
}

fn default_session_sweep_interval_secs() -> u64 {
    5 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_sane_settings() {
        let settings = Config::default().collab_settings();
        assert_eq!(settings.dedup_window, Duration::from_secs(30));
        assert_eq!(settings.idle_timeout, Duration::from_secs(90));
        assert_eq!(settings.outbound_queue_size, 256);
        assert_eq!(settings.mutation_send_retries, 3);
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let config = Config { outbound_queue_size: 0, cursor_buffer_size: 0, ..Config::default() };
        let settings = config.collab_settings();
        assert_eq!(settings.outbound_queue_size, 1);
        assert_eq!(settings.cursor_buffer_size, 1);
    }

    #[test]
    fn server_address_joins_host_and_port() {
        let config = Config { host: "127.0.0.1".into(), port: 9000, ..Config::default() };
        assert_eq!(config.server_address(), "127.0.0.1:9000");
        assert!(config.is_development());
    }
}
