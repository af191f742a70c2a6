//! Configuration management for member-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::DEFAULT_PROFILE_FIELDS;

/// Prefix of the environment variables read by [`Config::from_env`]
pub const ENV_PREFIX: &str = "MEMBER_SYNC_";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Update driver configuration
    #[serde(default)]
    pub driver: DriverConfig,

    /// Upstream API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Transient-error retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml)?;
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix MEMBER_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = env_var("DATABASE_PATH") {
            config.database.path = path;
        }

        if let Some(secs) = env_var("DRIVER_POLL_INTERVAL_SECS") {
            config.driver.poll_interval_secs = parse_env("DRIVER_POLL_INTERVAL_SECS", &secs)?;
        }
        if let Some(limit) = env_var("DRIVER_CLAIM_LIMIT") {
            config.driver.claim_limit = parse_env("DRIVER_CLAIM_LIMIT", &limit)?;
        }

        if let Some(url) = env_var("UPSTREAM_BASE_URL") {
            config.upstream.base_url = url;
        }
        if let Some(version) = env_var("UPSTREAM_API_VERSION") {
            config.upstream.api_version = version;
        }

        if let Some(ms) = env_var("RETRY_QUOTA_WINDOW_MS") {
            config.retry.quota_window_ms = parse_env("RETRY_QUOTA_WINDOW_MS", &ms)?;
        }

        if let Some(level) = env_var("LOGGING_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = env_var("LOGGING_FORMAT") {
            config.logging.format = format;
        }

        if let Some(enabled) = env_var("OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Some(endpoint) = env_var("OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.is_empty() {
            return Err(ConfigError::MissingRequired("database.path".to_string()));
        }
        if self.driver.claim_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "driver.claim_limit must be greater than 0".to_string(),
            ));
        }
        if self.driver.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "driver.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.upstream.max_calls_per_request == 0
            || self.upstream.max_calls_per_request > MAX_EXECUTE_CALLS
        {
            return Err(ConfigError::InvalidValue(format!(
                "upstream.max_calls_per_request must be between 1 and {}",
                MAX_EXECUTE_CALLS
            )));
        }
        for (name, size) in [
            ("members_per_page", self.upstream.members_per_page),
            ("users_per_page", self.upstream.users_per_page),
        ] {
            if size == 0 || size > MAX_PAGE_SIZE {
                return Err(ConfigError::InvalidValue(format!(
                    "upstream.{} must be between 1 and {}",
                    name, MAX_PAGE_SIZE
                )));
            }
        }
        if self.retry.quota_window_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "retry.quota_window_ms must be greater than 0".to_string(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidValue(format!(
                "logging.format must be json or pretty, got {}",
                self.logging.format
            )));
        }
        if self.otel.enabled && self.otel.endpoint.is_none() {
            return Err(ConfigError::MissingRequired("otel.endpoint".to_string()));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Parse(format!("Invalid value for {}{}", ENV_PREFIX, name)))
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "/data/db/member-sync.db".to_string()
}

/// Update driver configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverConfig {
    /// Seconds between claim cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum number of jobs claimed per cycle
    #[serde(default = "default_claim_limit")]
    pub claim_limit: u32,

    /// Delay before the first cycle in seconds
    #[serde(default)]
    pub initial_delay_secs: u64,
}

impl DriverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            claim_limit: default_claim_limit(),
            initial_delay_secs: 0,
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_claim_limit() -> u32 {
    5
}

/// Most sub-calls the upstream accepts in one `execute`
pub const MAX_EXECUTE_CALLS: usize = 25;

/// Largest page `groups.getMembers` and `users.get` serve
pub const MAX_PAGE_SIZE: u64 = 1000;

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL; methods live under `{base_url}/method/`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API version sent as `v`
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Sub-calls combined into one physical request
    #[serde(default = "default_max_calls_per_request")]
    pub max_calls_per_request: usize,

    /// Members per `groups.getMembers` page
    #[serde(default = "default_page_size")]
    pub members_per_page: u64,

    /// Users per `users.get` page
    #[serde(default = "default_page_size")]
    pub users_per_page: u64,

    /// Profile fields requested from `users.get`
    #[serde(default = "default_profile_fields")]
    pub profile_fields: String,
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout(),
            max_calls_per_request: default_max_calls_per_request(),
            members_per_page: default_page_size(),
            users_per_page: default_page_size(),
            profile_fields: default_profile_fields(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.vk.com".to_string()
}

fn default_api_version() -> String {
    "5.236".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_calls_per_request() -> usize {
    MAX_EXECUTE_CALLS
}

fn default_page_size() -> u64 {
    MAX_PAGE_SIZE
}

fn default_profile_fields() -> String {
    DEFAULT_PROFILE_FIELDS.to_string()
}

/// Retry configuration for transient upstream errors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Length of the upstream quota window in milliseconds
    #[serde(default = "default_quota_window")]
    pub quota_window_ms: u64,
}

impl RetryConfig {
    pub fn quota_window(&self) -> Duration {
        Duration::from_millis(self.quota_window_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            quota_window_ms: default_quota_window(),
        }
    }
}

fn default_quota_window() -> u64 {
    1000
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "member-sync".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format, `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax; unknown variables are left as written
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid expansion pattern: {}", e)))?;

    Ok(re
        .replace_all(input, |caps: &regex_lite::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned())
}
