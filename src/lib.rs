//! Circuit Gateway
//!
//! A request gateway that routes traffic to named backend services, guarding each one with
//! a circuit breaker, a fixed-window rate limiter and periodic health probing.

pub mod api;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod middleware;

pub use error::{GatewayError, Result};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use backend::registry::ServiceRegistry;
use backend::traits::Upstream;
use clock::Clock;
use gateway::{
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager},
    health_check::HealthCheckManager,
    rate_limit::RateLimiter,
    router::GatewayRouter,
};

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<config::Settings>,
    pub gateway: Arc<GatewayRouter>,
    pub health_manager: Arc<HealthCheckManager>,
    pub started_at: DateTime<Utc>,
    pub shutdown: CancellationToken,
    started: Instant,
}

impl AppState {
    /// Wire the registry, breakers, limiter and router from validated settings
    pub fn from_settings(
        settings: config::Settings,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ServiceRegistry::from_settings(
            &settings,
            upstream.clone(),
            clock.clone(),
        )?);
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig::from(&settings.circuit_breaker),
            clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(clock.clone()));

        let gateway = Arc::new(GatewayRouter::new(
            registry.clone(),
            breakers,
            limiter,
            upstream,
            settings.gateway.routing_prefix.clone(),
            shutdown.clone(),
        ));
        let health_manager = Arc::new(HealthCheckManager::new(
            registry,
            Duration::from_secs(settings.health_check.interval_secs),
        ));

        Ok(Self {
            settings: Arc::new(settings),
            gateway,
            health_manager,
            started_at: clock.now(),
            shutdown,
            started: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
