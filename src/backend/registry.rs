//! Service registry: the catalog of backend services and their live health

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::traits::{RateLimitPolicy, ServiceDescriptor, Upstream};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{GatewayError, Result};

/// Health status derived from consecutive probe failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// 0 failures is healthy, 1-2 degraded, 3 or more unhealthy
    pub fn from_consecutive_failures(failures: u32) -> Self {
        match failures {
            0 => HealthStatus::Healthy,
            1..=2 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// Rolling health record of one service, overwritten on every probe
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub uptime_ratio: f64,
    pub total_checks: u64,
    pub successful_checks: u64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy, // Assume healthy until proven otherwise
            last_checked: None,
            response_time_ms: None,
            consecutive_failures: 0,
            uptime_ratio: 1.0,
            total_checks: 0,
            successful_checks: 0,
        }
    }
}

impl HealthRecord {
    fn observe(&mut self, success: bool, response_time_ms: u64, at: DateTime<Utc>) {
        self.total_checks += 1;
        if success {
            self.successful_checks += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.status = HealthStatus::from_consecutive_failures(self.consecutive_failures);
        self.last_checked = Some(at);
        self.response_time_ms = Some(response_time_ms);
        self.uptime_ratio = self.successful_checks as f64 / self.total_checks as f64;
    }
}

/// Per-service line of the registry stats
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub name: String,
    pub base_address: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub uptime_ratio: f64,
}

/// Aggregate health counts across the registry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub services: Vec<ServiceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub descriptor: ServiceDescriptor,
    pub health: HealthRecord,
}

/// Full operator view of the registry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub generated_at: DateTime<Utc>,
    pub probe_timeout_ms: u64,
    pub services: Vec<RegistryEntry>,
}

/// Registry of backend services
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceDescriptor>>,
    health: DashMap<String, HealthRecord>,
    upstream: Arc<dyn Upstream>,
    probe_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new(upstream: Arc<dyn Upstream>, probe_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            services: DashMap::new(),
            health: DashMap::new(),
            upstream,
            probe_timeout,
            clock,
        }
    }

    /// Build the registry from configuration, registering every configured service
    pub fn from_settings(
        settings: &Settings,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = Self::new(
            upstream,
            Duration::from_millis(settings.health_check.timeout_ms),
            clock,
        );

        for service in &settings.services {
            let policy = service
                .rate_limit
                .map(|p| RateLimitPolicy {
                    window_duration_ms: p.window_ms,
                    max_requests_per_window: p.max_requests,
                })
                .unwrap_or(RateLimitPolicy {
                    window_duration_ms: settings.rate_limit.window_ms,
                    max_requests_per_window: settings.rate_limit.max_requests,
                });

            registry.register(ServiceDescriptor {
                name: service.name.clone(),
                base_address: service.base_address.clone(),
                request_timeout: Duration::from_millis(service.timeout_ms),
                health_check_path: service
                    .health_check_path
                    .clone()
                    .unwrap_or_else(|| settings.health_check.path.clone()),
                rate_limit_policy: policy,
            })?;
        }

        Ok(registry)
    }

    /// Register a service. Names are unique; re-registering is an error.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        match self.services.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GatewayError::InvalidRequest(format!(
                    "Service '{}' is already registered",
                    name
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!(
                    service = %name,
                    base_address = %descriptor.base_address,
                    timeout_ms = descriptor.request_timeout.as_millis() as u64,
                    "Registered service"
                );
                entry.insert(Arc::new(descriptor));
            }
        }
        self.health.insert(name, HealthRecord::default());
        Ok(())
    }

    /// Remove a service and its health record
    pub fn deregister(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        let removed = self.services.remove(name).map(|(_, d)| d);
        if removed.is_some() {
            self.health.remove(name);
            info!(service = %name, "Deregistered service");
        }
        removed
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).map(|d| d.clone())
    }

    /// Names of all registered services, sorted
    pub fn get_all_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Most recent health record, without probing
    pub fn get_health(&self, name: &str) -> Option<HealthRecord> {
        self.health.get(name).map(|h| h.clone())
    }

    /// Probe a service's health endpoint now and fold the outcome into its record
    pub async fn check_service_health(&self, name: &str) -> Result<HealthRecord> {
        let descriptor = self
            .get_service(name)
            .ok_or_else(|| GatewayError::ServiceNotFound(name.to_string()))?;

        let url = descriptor.health_url();
        let started = Instant::now();
        let outcome = self.upstream.probe(&url, self.probe_timeout).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let success = match &outcome {
            Ok(status) if status.is_success() => {
                debug!(service = %name, response_time_ms = elapsed_ms, "Health check passed");
                true
            }
            Ok(status) => {
                debug!(service = %name, status = %status, "Health check failed");
                false
            }
            Err(e) => {
                debug!(service = %name, error = %e, "Health check failed");
                false
            }
        };

        let now = self.clock.now();
        // The service may have been deregistered while the probe was in flight
        let mut record = self
            .health
            .get_mut(name)
            .ok_or_else(|| GatewayError::ServiceNotFound(name.to_string()))?;
        let previous = record.status;
        record.observe(success, elapsed_ms, now);

        if previous != record.status {
            match record.status {
                HealthStatus::Healthy => info!(service = %name, "Service recovered and marked healthy"),
                status => warn!(
                    service = %name,
                    status = ?status,
                    consecutive_failures = record.consecutive_failures,
                    "Service health degraded"
                ),
            }
        }

        Ok(record.clone())
    }

    /// Aggregate view of service health
    pub fn get_service_stats(&self) -> RegistryStats {
        let mut services = Vec::with_capacity(self.services.len());
        for name in self.get_all_services() {
            let Some(descriptor) = self.get_service(&name) else {
                continue;
            };
            let health = self.get_health(&name).unwrap_or_default();
            services.push(ServiceStats {
                name,
                base_address: descriptor.base_address.clone(),
                status: health.status,
                response_time_ms: health.response_time_ms,
                consecutive_failures: health.consecutive_failures,
                uptime_ratio: health.uptime_ratio,
            });
        }

        let count = |status: HealthStatus| services.iter().filter(|s| s.status == status).count();
        RegistryStats {
            total: services.len(),
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy: count(HealthStatus::Unhealthy),
            services,
        }
    }

    /// Descriptors and health of every registered service
    pub fn get_registry_snapshot(&self) -> RegistrySnapshot {
        let services = self
            .get_all_services()
            .into_iter()
            .filter_map(|name| {
                let descriptor = self.get_service(&name)?;
                Some(RegistryEntry {
                    descriptor: descriptor.as_ref().clone(),
                    health: self.get_health(&name).unwrap_or_default(),
                })
            })
            .collect();

        RegistrySnapshot {
            generated_at: self.clock.now(),
            probe_timeout_ms: self.probe_timeout.as_millis() as u64,
            services,
        }
    }
}
