//! Application settings and configuration management

use crate::error::{GatewayError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on draining in-flight requests after a shutdown signal
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Path namespace under which `/<service>/...` is proxied
    #[serde(default = "default_routing_prefix")]
    pub routing_prefix: String,
    /// Header identifying the caller for rate limiting
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,
}

fn default_routing_prefix() -> String {
    "/api".to_string()
}

fn default_client_id_header() -> String {
    "x-client-id".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            routing_prefix: default_routing_prefix(),
            client_id_header: default_client_id_header(),
        }
    }
}

/// How many requests an elapsed OPEN circuit lets through while HALF_OPEN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// One outstanding probe; further requests are rejected until it reports back
    #[default]
    SingleProbe,
    /// Every request is admitted while HALF_OPEN until the first failure reopens
    MultipleProbes,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration")]
    pub open_duration_secs: u64,
    #[serde(default)]
    pub half_open_policy: HalfOpenPolicy,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration() -> u64 {
    60
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration(),
            half_open_policy: HalfOpenPolicy::default(),
        }
    }
}

/// Health probing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_check_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_check_path")]
    pub path: String,
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_check_interval(),
            timeout_ms: default_probe_timeout(),
            path: default_health_check_path(),
        }
    }
}

/// Gateway-wide rate limit defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Interval of the expired-window sweep, 0 disables it
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u32 {
    100
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Per-service rate limit policy as written in configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct RateLimitPolicyConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

/// Backend service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub base_address: String,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Overrides `health_check.path` for this service
    #[serde(default)]
    pub health_check_path: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicyConfig>,
}

fn default_timeout() -> u64 {
    30_000
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
        Self::load_from_path(path)
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_str().ok_or_else(|| {
            GatewayError::Config(config::ConfigError::Message(
                "Configuration path is not valid UTF-8".to_string(),
            ))
        })?;

        let config = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .set_default("gateway.routing_prefix", default_routing_prefix())?
            .set_default(
                "circuit_breaker.failure_threshold",
                i64::from(default_failure_threshold()),
            )?
            .set_default(
                "circuit_breaker.open_duration_secs",
                default_open_duration() as i64,
            )?
            .set_default(
                "health_check.interval_secs",
                default_health_check_interval() as i64,
            )?
            // Load from configuration file
            .add_source(File::with_name(path).required(false))
            // Override with environment variables (prefixed with GATEWAY__)
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(invalid("Server port cannot be 0"));
        }

        if !self.gateway.routing_prefix.starts_with('/') {
            return Err(invalid(format!(
                "Routing prefix '{}' must start with '/'",
                self.gateway.routing_prefix
            )));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("Circuit breaker failure threshold must be at least 1"));
        }

        if self.rate_limit.window_ms == 0 || self.rate_limit.max_requests == 0 {
            return Err(invalid("Default rate limit window and quota must be positive"));
        }

        if self.health_check.enabled && self.health_check.interval_secs == 0 {
            return Err(invalid("Health check interval must be at least 1 second"));
        }

        if self.health_check.timeout_ms == 0 {
            return Err(invalid("Health check timeout must be positive"));
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(invalid("Service name cannot be empty"));
            }
            if service.name.contains('/') {
                return Err(invalid(format!(
                    "Service name '{}' cannot contain '/'",
                    service.name
                )));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(invalid(format!("Duplicate service name '{}'", service.name)));
            }
            if reqwest::Url::parse(&service.base_address).is_err() {
                return Err(invalid(format!(
                    "Service '{}' has invalid base address '{}'",
                    service.name, service.base_address
                )));
            }
            if service.timeout_ms == 0 {
                return Err(invalid(format!(
                    "Service '{}' must have a non-zero timeout",
                    service.name
                )));
            }
            if let Some(policy) = service.rate_limit {
                if policy.window_ms == 0 || policy.max_requests == 0 {
                    return Err(invalid(format!(
                        "Service '{}' rate limit window and quota must be positive",
                        service.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::Config(config::ConfigError::Message(message.into()))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            health_check: HealthCheckConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
            services: vec![],
        }
    }
}
