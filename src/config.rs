//! Configuration management for Ratewarden.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `WARDEN__`-prefixed environment variables
//! (for example `WARDEN__REDIS__URL` or `WARDEN__RATE_LIMITING__BURST`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WardenError};

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "WARDEN";
/// Separator between nested keys in environment variable names.
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared store connection configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Deployment environment name (`production` switches to JSON logs)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Upper bound on graceful shutdown, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Requests slower than this are logged at warn level, in milliseconds
    #[serde(default = "default_slow_request")]
    pub slow_request_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            environment: default_environment(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            slow_request_ms: default_slow_request(),
        }
    }
}

impl ServerConfig {
    /// Whether the service runs in the production environment.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn slow_request(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_shutdown_timeout() -> u64 {
    15_000
}

fn default_slow_request() -> u64 {
    500
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, including password and database index
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Dial timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-command response timeout in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// Budget for the startup `PING`, in milliseconds
    #[serde(default = "default_startup_ping_timeout")]
    pub startup_ping_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
            startup_ping_timeout_ms: default_startup_ping_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_response_timeout() -> u64 {
    10_000
}

fn default_startup_ping_timeout() -> u64 {
    5_000
}

/// Which shared state store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis, shared by every process pointed at the same instance
    #[default]
    Redis,
    /// In-process store; only coordinates callers within one process
    Memory,
}

/// What the limiter does when the store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the call. Rate limiting is silently disabled while the store is down.
    #[default]
    FailOpen,
    /// Reject the call with a zero wait.
    FailClosed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Namespace prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Requests admitted instantaneously above the sustained rate
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Sustained admission rate per caller
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: f64,

    /// Budget for one store round trip, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Behavior when the store is unreachable or times out
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            burst: default_burst(),
            rate_per_second: default_rate_per_second(),
            store_timeout_ms: default_store_timeout(),
            failure_policy: FailurePolicy::default(),
            backend: StoreBackend::default(),
        }
    }
}

impl RateLimitingConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_burst() -> u32 {
    100
}

fn default_rate_per_second() -> f64 {
    20.0
}

fn default_store_timeout() -> u64 {
    250
}

impl WardenConfig {
    /// Load configuration from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WardenError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.key_prefix.is_empty() {
            return Err(WardenError::Config(
                "rate_limiting.key_prefix must not be empty".to_string(),
            ));
        }
        if self.rate_limiting.store_timeout_ms == 0 {
            return Err(WardenError::Config(
                "rate_limiting.store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
