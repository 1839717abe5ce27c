//! Fixed-window rate limiting per (service, client)

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::traits::RateLimitPolicy;
use crate::clock::{to_chrono, Clock};

/// Request count of one client inside one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: u32,
}

impl RateLimitWindow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }
}

#[derive(Debug, Error)]
pub enum RateLimitStoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for rate-limit windows
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `(service, client)`, opening a fresh window if the previous
    /// one has expired, and return the window after the increment
    fn hit(
        &self,
        service: &str,
        client: &str,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<RateLimitWindow, RateLimitStoreError>;

    /// Drop windows that ended at or before `now`, returning how many were removed
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;

    /// Drop every window of a service
    fn remove_service(&self, service: &str) -> usize;

    fn window_count(&self) -> usize;
}

/// In-process window store
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<(String, String), RateLimitWindow>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryWindowStore {
    fn hit(
        &self,
        service: &str,
        client: &str,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<RateLimitWindow, RateLimitStoreError> {
        let fresh = || RateLimitWindow {
            window_start: now,
            window_end: now
                .checked_add_signed(window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            count: 0,
        };

        let mut entry = self
            .windows
            .entry((service.to_string(), client.to_string()))
            .or_insert_with(&fresh);

        if entry.is_expired(now) {
            *entry = fresh();
        }
        entry.count = entry.count.saturating_add(1);
        Ok(*entry)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    fn remove_service(&self, service: &str) -> usize {
        let before = self.windows.len();
        self.windows.retain(|(s, _), _| s != service);
        before.saturating_sub(self.windows.len())
    }

    fn window_count(&self) -> usize {
        self.windows.len()
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub permitted: bool,
    /// Time until the current window ends; 0 when permitted
    pub retry_after_ms: u64,
    pub remaining: u32,
    pub limit: u32,
}

/// Per-service, per-client request limiter
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_store(Arc::new(InMemoryWindowStore::new()), clock)
    }

    pub fn with_store(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Count a request from `client_key` against `service`'s policy.
    ///
    /// Store failures permit the request: gateway availability wins over strict quotas.
    pub fn allow(&self, service: &str, client_key: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.now();
        let window = to_chrono(Duration::from_millis(policy.window_duration_ms));
        let limit = policy.max_requests_per_window;

        match self.store.hit(service, client_key, now, window) {
            Ok(current) if current.count > limit => {
                let retry_after_ms = (current.window_end - now).num_milliseconds().max(1) as u64;
                debug!(
                    service = %service,
                    client = %client_key,
                    count = current.count,
                    limit,
                    retry_after_ms,
                    "Rate limit exceeded"
                );
                RateLimitDecision {
                    permitted: false,
                    retry_after_ms,
                    remaining: 0,
                    limit,
                }
            }
            Ok(current) => RateLimitDecision {
                permitted: true,
                retry_after_ms: 0,
                remaining: limit - current.count,
                limit,
            },
            Err(e) => {
                warn!(service = %service, error = %e, "Rate limit store failed, allowing request");
                RateLimitDecision {
                    permitted: true,
                    retry_after_ms: 0,
                    remaining: limit,
                    limit,
                }
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired(self.clock.now())
    }

    pub fn remove_service(&self, service: &str) -> usize {
        self.store.remove_service(service)
    }

    pub fn window_count(&self) -> usize {
        self.store.window_count()
    }

    /// Periodically drop expired windows until `shutdown` is cancelled.
    ///
    /// A zero interval disables the sweeper and returns `None`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            debug!("Rate limit sweeper disabled");
            return None;
        }
        let limiter = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = limiter.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired rate limit windows");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Rate limit sweeper shutting down");
                        break;
                    }
                }
            }
        }))
    }
}
