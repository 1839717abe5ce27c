//! Configuration module

pub mod settings;

pub use settings::{
    CircuitBreakerSettings, GatewayConfig, HalfOpenPolicy, HealthCheckConfig, LoggingConfig,
    RateLimitConfig, RateLimitPolicyConfig, ServerConfig, ServiceConfig, Settings,
};
