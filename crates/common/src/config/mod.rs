//! Configuration management for PulseGrid services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration
    pub redis: RedisConfig,

    /// Session lifecycle configuration
    pub session: SessionConfig,

    /// Broadcast bridge configuration
    pub bridge: BridgeConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Maximum session age in seconds; also the fast-cache TTL
    #[serde(default = "default_max_session_age")]
    pub max_session_age_secs: u64,

    /// Per-platform rotation timer interval in seconds
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,

    /// Expiry sweep interval in seconds
    #[serde(default = "default_expiry_sweep")]
    pub expiry_sweep_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Consumer group name shared by all bridge instances
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name within the group (defaults to a generated name)
    pub consumer_name: Option<String>,

    /// Maximum entries fetched per read
    #[serde(default = "default_read_batch")]
    pub read_batch_size: usize,

    /// Upper bound on a blocking read, in milliseconds
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,

    /// Delay after a failed read before retrying, in seconds
    #[serde(default = "default_read_backoff")]
    pub read_backoff_secs: u64,

    /// Heartbeat ping interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Per-client bounded send queue length
    #[serde(default = "default_max_send_queue")]
    pub max_send_queue: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8090 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_key_prefix() -> String { "pulsegrid".to_string() }
fn default_max_session_age() -> u64 { 24 * 60 * 60 }
fn default_rotation_interval() -> u64 { 6 * 60 * 60 }
fn default_expiry_sweep() -> u64 { 5 * 60 }
fn default_consumer_group() -> String { "pulsegrid-bridge".to_string() }
fn default_read_batch() -> usize { 32 }
fn default_read_block_ms() -> u64 { 2000 }
fn default_read_backoff() -> u64 { 5 }
fn default_heartbeat_interval() -> u64 { 30 }
fn default_max_send_queue() -> usize { 256 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "pulsegrid".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8091
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        let mut config: Self = config.try_deserialize()?;
        config.session.clamp_rotation_interval();
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let mut config: Self = config.try_deserialize()?;
        config.session.clamp_rotation_interval();
        Ok(config)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl SessionConfig {
    /// Rotating less often than sessions live would leave lookups creating
    /// fresh sessions between firings; the interval is capped at the max age.
    pub fn clamp_rotation_interval(&mut self) {
        if self.rotation_interval_secs > self.max_session_age_secs {
            warn!(
                rotation_interval_secs = self.rotation_interval_secs,
                max_session_age_secs = self.max_session_age_secs,
                "rotation interval exceeds max session age, clamping"
            );
            self.rotation_interval_secs = self.max_session_age_secs;
        }
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_secs)
    }
}

impl BridgeConfig {
    /// Consumer name within the shared group; generated when not configured.
    pub fn consumer_name(&self) -> String {
        self.consumer_name.clone().unwrap_or_else(|| {
            format!("bridge-{}", uuid_suffix())
        })
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_secs(self.read_backoff_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn uuid_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                shutdown_timeout_secs: default_shutdown_timeout(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/pulsegrid".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                key_prefix: default_key_prefix(),
            },
            session: SessionConfig {
                max_session_age_secs: default_max_session_age(),
                rotation_interval_secs: default_rotation_interval(),
                expiry_sweep_secs: default_expiry_sweep(),
            },
            bridge: BridgeConfig {
                consumer_group: default_consumer_group(),
                consumer_name: None,
                read_batch_size: default_read_batch(),
                read_block_ms: default_read_block_ms(),
                read_backoff_secs: default_read_backoff(),
                heartbeat_interval_secs: default_heartbeat_interval(),
                max_send_queue: default_max_send_queue(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
                service_name: default_service_name(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.bridge.consumer_group, "pulsegrid-bridge");
        assert_eq!(config.session.max_session_age_secs, 86400);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/pulsegrid");
    }

    #[test]
    fn test_rotation_interval_clamped_to_max_age() {
        let mut session = SessionConfig {
            max_session_age_secs: 3600,
            rotation_interval_secs: 7200,
            expiry_sweep_secs: 300,
        };
        session.clamp_rotation_interval();
        assert_eq!(session.rotation_interval_secs, 3600);
    }

    #[test]
    fn test_rotation_interval_within_max_age_untouched() {
        let mut session = SessionConfig {
            max_session_age_secs: 7200,
            rotation_interval_secs: 3600,
            expiry_sweep_secs: 300,
        };
        session.clamp_rotation_interval();
        assert_eq!(session.rotation_interval_secs, 3600);
    }

    #[test]
    fn test_generated_consumer_name() {
        let config = AppConfig::default();
        let name = config.bridge.consumer_name();
        assert!(name.starts_with("bridge-"));
        assert_ne!(name, config.bridge.consumer_name());
    }
}
