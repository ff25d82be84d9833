//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay gateway from a TOML file
//! at `~/.config/relay-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied with [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/relay-gateway/gateway.toml` (typically `~/.config/relay-gateway/gateway.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//!
//! [relay]
//! max_retries = 3
//! reserve_estimate = 1
//! route_prefix = "/generalProxy"
//! model_header = "X-API-Model"
//! bytes_per_unit = 1024
//!
//! [health]
//! cooldown_secs = 5
//!
//! [upstream]
//! connect_timeout_ms = 10000
//! response_header_timeout_ms = 120000
//!
//! [aliases]
//! turnstile = "CapchaTurnstileTask"
//!
//! [pricing.default]
//! request = 1
//! unit = 0
//!
//! [[channels]]
//! id = 1
//! name = "solver-a"
//! base_url = "https://api.solver.example"
//! key = '{"appId":"...","clientKey":"..."}'
//! models = ["CapchaTurnstileTask"]
//! priority = 10
//!
//! [[callers]]
//! token = "sk-caller"
//! name = "alice"
//! quota = 10000
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::Channel;
use crate::provider::ClientConfig;
use crate::quota::PriceTable;
use crate::relay::RelaySettings;
use crate::routing::health::HealthConfig;

/// Default listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:3000";

/// Environment variables read by [`load_config`]
pub const ENV_VARS: &[&str] = &[
    "RELAY_LISTEN",
    "RELAY_MAX_RETRIES",
    "RELAY_COOLDOWN_SECS",
    "RELAY_ROUTE_PREFIX",
    "RELAY_MODEL_HEADER",
];

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address (`host:port`)
    pub listen: Option<String>,
}

/// Relay section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Retries after the first attempt
    pub max_retries: Option<u32>,

    /// Quota held per request while attempts run
    pub reserve_estimate: Option<i64>,

    /// Gateway path prefix stripped before forwarding
    pub route_prefix: Option<String>,

    /// Header naming the requested model
    pub model_header: Option<String>,

    /// Bytes per usage unit
    pub bytes_per_unit: Option<u64>,
}

/// Health section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Cooldown window in seconds (0 disables cooldowns)
    pub cooldown_secs: Option<u64>,
}

/// Upstream client section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamToml {
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Time allowed until response headers arrive, in milliseconds
    pub response_header_timeout_ms: Option<u64>,

    /// Idle keep-alive connections per upstream host
    pub max_idle_per_host: Option<usize>,

    /// Idle connection lifetime in seconds
    pub pool_idle_timeout_secs: Option<u64>,
}

/// A caller allowed to use the gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerConfig {
    /// Bearer token presented by the caller
    pub token: String,

    /// Caller id used for quota accounting and logs
    pub name: String,

    /// Starting quota balance
    #[serde(default)]
    pub quota: i64,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    pub server: ServerToml,
    pub relay: RelayToml,
    pub health: HealthToml,
    pub upstream: UpstreamToml,
    pub aliases: HashMap<String, String>,
    pub pricing: PriceTable,
    pub channels: Vec<Channel>,
    pub callers: Vec<CallerConfig>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized gateway configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Listen address
    pub listen: String,

    /// Orchestrator settings
    pub relay: RelaySettings,

    /// Channel health settings
    pub health: HealthConfig,

    /// Upstream client settings
    pub upstream: ClientConfig,

    /// Global model aliases
    pub aliases: HashMap<String, String>,

    /// Model prices
    pub pricing: PriceTable,

    /// Upstream channels
    pub channels: Vec<Channel>,

    /// Callers and their starting quota
    pub callers: Vec<CallerConfig>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            relay: RelaySettings::default(),
            health: HealthConfig::default(),
            upstream: ClientConfig::default(),
            aliases: HashMap::new(),
            pricing: PriceTable::default(),
            channels: Vec::new(),
            callers: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] naming the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.model_header_name().is_err() || self.relay.model_header.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "model_header {:?} is not a valid header name",
                self.relay.model_header
            )));
        }
        if let Err(e) = self.relay.normalized_route_prefix() {
            return Err(ConfigError::ValidationError(e.to_string()));
        }
        if self.relay.reserve_estimate < 0 {
            return Err(ConfigError::ValidationError(
                "reserve_estimate must not be negative".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
            if channel.trimmed_base_url().trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "channel {} has an empty base_url",
                    channel.id
                )));
            }
        }

        let mut tokens = HashSet::new();
        for caller in &self.callers {
            if caller.token.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "caller {} has an empty token",
                    caller.name
                )));
            }
            if !tokens.insert(caller.token.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate token for caller {}",
                    caller.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay-gateway/gateway.toml` or
/// `~/.config/relay-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay-gateway").join("gateway.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<GatewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                channels = config.channels.len(),
                callers = config.callers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: GatewayToml) {
    if let Some(listen) = toml.server.listen {
        config.listen = listen;
    }

    if let Some(retries) = toml.relay.max_retries {
        config.relay.max_retries = retries;
    }
    if let Some(estimate) = toml.relay.reserve_estimate {
        config.relay.reserve_estimate = estimate;
    }
    if let Some(prefix) = toml.relay.route_prefix {
        config.relay.route_prefix = prefix;
    }
    if let Some(header) = toml.relay.model_header {
        config.relay.model_header = header;
    }
    if let Some(bytes) = toml.relay.bytes_per_unit {
        config.relay.bytes_per_unit = bytes;
    }

    if let Some(secs) = toml.health.cooldown_secs {
        config.health.cooldown = Duration::from_secs(secs);
    }

    if let Some(ms) = toml.upstream.connect_timeout_ms {
        config.upstream.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.upstream.response_header_timeout_ms {
        config.upstream.response_header_timeout = Duration::from_millis(ms);
    }
    if let Some(idle) = toml.upstream.max_idle_per_host {
        config.upstream.max_idle_per_host = idle;
    }
    if let Some(secs) = toml.upstream.pool_idle_timeout_secs {
        config.upstream.pool_idle_timeout = Duration::from_secs(secs);
    }

    config.aliases = toml.aliases;
    config.pricing = toml.pricing;
    config.channels = toml.channels;
    config.callers = toml.callers;
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut GatewayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(listen) = env("RELAY_LISTEN") {
        config.listen = listen;
        config.source = ConfigSource::Env;
    }
    if let Some(retries) = env("RELAY_MAX_RETRIES") {
        if let Ok(n) = retries.parse::<u32>() {
            config.relay.max_retries = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(cooldown) = env("RELAY_COOLDOWN_SECS") {
        if let Ok(secs) = cooldown.parse::<u64>() {
            config.health.cooldown = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(prefix) = env("RELAY_ROUTE_PREFIX") {
        config.relay.route_prefix = prefix;
        config.source = ConfigSource::Env;
    }
    if let Some(header) = env("RELAY_MODEL_HEADER") {
        config.relay.model_header = header;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub listen: Option<String>,

    /// Max retries override
    pub max_retries: Option<u32>,

    /// Cooldown window override (seconds)
    pub cooldown_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = Some(listen.into());
        self
    }

    /// Set max retries override
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set cooldown override
    #[must_use]
    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.listen.is_some() || self.max_retries.is_some() || self.cooldown_secs.is_some() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref listen) = self.listen {
            config.listen = listen.clone();
        }
        if let Some(retries) = self.max_retries {
            config.relay.max_retries = retries;
        }
        if let Some(secs) = self.cooldown_secs {
            config.health.cooldown = Duration::from_secs(secs);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
