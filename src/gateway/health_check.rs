//! Health check manager for periodically probing backend services

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::registry::ServiceRegistry;
use crate::error::GatewayError;

struct ProbeLoop {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Runs one probe task per registered service.
///
/// Probe results only feed the registry's health records; they never gate traffic.
pub struct HealthCheckManager {
    registry: Arc<ServiceRegistry>,
    interval: Duration,
    probe_loop: RwLock<Option<ProbeLoop>>,
}

impl HealthCheckManager {
    /// Create a new health check manager
    pub fn new(registry: Arc<ServiceRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            probe_loop: RwLock::new(None),
        }
    }

    /// Start probing every currently registered service.
    ///
    /// The loop stops when `shutdown` is cancelled or [`stop_health_checking`] is called.
    /// Calling this while already running is a no-op.
    ///
    /// [`stop_health_checking`]: HealthCheckManager::stop_health_checking
    pub async fn start_health_checking(&self, shutdown: &CancellationToken) {
        let mut probe_loop = self.probe_loop.write().await;
        if probe_loop.is_some() {
            debug!("Health checking already running");
            return;
        }

        let token = shutdown.child_token();
        let services = self.registry.get_all_services();
        let handles = services
            .iter()
            .map(|name| self.spawn_probe_task(name.clone(), token.clone()))
            .collect();

        *probe_loop = Some(ProbeLoop { token, handles });
        info!(
            interval_secs = self.interval.as_secs(),
            services = services.len(),
            "Started health check background tasks"
        );
    }

    fn spawn_probe_task(&self, name: String, token: CancellationToken) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = registry.check_service_health(&name) => result,
                };

                match result {
                    Ok(record) => debug!(
                        service = %name,
                        status = ?record.status,
                        consecutive_failures = record.consecutive_failures,
                        "Health check completed"
                    ),
                    Err(GatewayError::ServiceNotFound(_)) => {
                        debug!(service = %name, "Service deregistered, stopping health checks");
                        break;
                    }
                    Err(e) => warn!(service = %name, error = %e, "Health check errored"),
                }
            }
        })
    }

    /// Stop the probe tasks and wait for them to exit
    pub async fn stop_health_checking(&self) {
        let Some(probe_loop) = self.probe_loop.write().await.take() else {
            return;
        };

        probe_loop.token.cancel();
        for handle in probe_loop.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Health check task ended abnormally");
                }
            }
        }
        info!("Stopped health check background tasks");
    }

    pub async fn is_running(&self) -> bool {
        self.probe_loop.read().await.is_some()
    }
}
