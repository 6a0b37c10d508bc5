//! Configuration management for Turnstile.
//!
//! Values come from an optional file and `TURNSTILE__`-prefixed environment
//! variables, the latter taking precedence. Nested keys use `__` as separator,
//! e.g. `TURNSTILE__RATE_LIMITING__BLOCK_SECS=30`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::ratelimit::DefaultLimits;

const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Header carrying a credential identity
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// Take the client address from `X-Forwarded-For` instead of the socket
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            credential_header: default_credential_header(),
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_credential_header() -> String {
    "API_KEY".to_string()
}

/// What the gate does when the store cannot produce a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailureMode {
    /// Reject the request with 503
    #[default]
    FailClosed,
    /// Forward the request unchecked
    FailOpen,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Default window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,

    /// Default cooldown in seconds once an identity exceeds its limit
    #[serde(default = "default_block_secs")]
    pub block_secs: i64,

    /// Default request limit for address identities
    #[serde(default = "default_max_requests_by_address")]
    pub max_requests_by_address: i64,

    /// Default request limit for credential identities
    #[serde(default = "default_max_requests_by_credential")]
    pub max_requests_by_credential: i64,

    /// Gate behaviour on store failure
    #[serde(default)]
    pub on_store_error: StoreFailureMode,

    /// Interval for idle-lock pruning and expired-entry purging
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Optional YAML file of policies applied at start-up
    #[serde(default)]
    pub seed_path: Option<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            block_secs: default_block_secs(),
            max_requests_by_address: default_max_requests_by_address(),
            max_requests_by_credential: default_max_requests_by_credential(),
            on_store_error: StoreFailureMode::default(),
            maintenance_interval_secs: default_maintenance_interval(),
            seed_path: None,
        }
    }
}

fn default_window_secs() -> i64 {
    1
}

fn default_block_secs() -> i64 {
    60
}

fn default_max_requests_by_address() -> i64 {
    10
}

fn default_max_requests_by_credential() -> i64 {
    100
}

fn default_maintenance_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    pub fn defaults(&self) -> DefaultLimits {
        DefaultLimits {
            window_seconds: self.window_secs,
            block_seconds: self.block_secs,
            max_requests_by_address: self.max_requests_by_address,
            max_requests_by_credential: self.max_requests_by_credential,
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Which store implementation backs the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps, single instance only
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every Redis key
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: String::new(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file overlaid with environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would seed invalid policies or stall maintenance.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting
            .defaults()
            .validate()
            .map_err(|e| GateError::Config(format!("rate_limiting: {}", e)))?;
        if self.rate_limiting.maintenance_interval_secs == 0 {
            return Err(GateError::Config(
                "rate_limiting.maintenance_interval_secs must be positive".into(),
            ));
        }
        if self.server.credential_header.trim().is_empty() {
            return Err(GateError::Config("server.credential_header is empty".into()));
        }
        Ok(())
    }
}
