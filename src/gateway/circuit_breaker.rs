//! Per-service circuit breakers
//!
//! One state machine per service name:
//! - Closed: requests pass; consecutive failures are counted
//! - Open: requests fail fast until the cool-down elapses
//! - HalfOpen: a trial request decides between Closed and Open
//!
//! Records live in a sharded concurrent map, so updates for one service never wait on
//! another service's lock and every transition is applied under that record's shard lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{to_chrono, Clock};
use crate::config::{CircuitBreakerSettings, HalfOpenPolicy};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning shared by all services
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit
    pub failure_threshold: u32,
    /// Cool-down before an open circuit admits a probe
    pub open_duration: Duration,
    pub half_open_policy: HalfOpenPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            half_open_policy: HalfOpenPolicy::SingleProbe,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            open_duration: Duration::from_secs(settings.open_duration_secs),
            half_open_policy: settings.half_open_policy,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    /// Set while a half-open probe is outstanding
    probe_started_at: Option<DateTime<Utc>>,
    /// Held open by an operator; ignores the cool-down
    forced_open: bool,
    times_opened: u64,
    rejected_requests: u64,
    /// Every failure ever recorded; unlike `failure_count` never reset by a success
    total_failures: u64,
}

impl CircuitRecord {
    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_at: self.last_failure_at,
            next_attempt_at: self.next_attempt_at,
            opened_at: self.opened_at,
            forced_open: self.forced_open,
            times_opened: self.times_opened,
            rejected_requests: self.rejected_requests,
        }
    }
}

/// Read-only view of one service's breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub forced_open: bool,
    pub times_opened: u64,
    pub rejected_requests: u64,
}

/// Aggregate breaker counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub total_circuits: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_trips: u64,
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
    pub half_open_policy: HalfOpenPolicy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerHealthDetail {
    pub total_circuits: usize,
    pub open_circuits: Vec<String>,
    pub half_open_circuits: Vec<String>,
}

/// Breaker-level health: healthy iff no circuit is open
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub healthy: bool,
    pub detail: BreakerHealthDetail,
}

/// Manages circuit breakers for all services
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitRecord>,
    clock: Arc<dyn Clock>,
    total_trips: AtomicU64,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            clock,
            total_trips: AtomicU64::new(0),
        }
    }

    /// Create the record for a service if it does not exist yet
    pub fn register(&self, service: &str) {
        self.circuits.entry(service.to_string()).or_default();
    }

    /// Drop a service's record; only used when the service is deregistered
    pub fn remove(&self, service: &str) -> bool {
        self.circuits.remove(service).is_some()
    }

    /// Whether requests to `service` must be rejected right now.
    ///
    /// An open circuit whose cool-down has elapsed moves to HALF_OPEN and admits the caller
    /// as the probe. Under [`HalfOpenPolicy::SingleProbe`] further callers are rejected until
    /// that probe reports back, or until a probe has been outstanding for a full cool-down
    /// (its caller went away without recording an outcome). Services without a record are
    /// never rejected here.
    pub fn is_open(&self, service: &str) -> bool {
        let now = self.clock.now();
        let open_duration = to_chrono(self.config.open_duration);
        let Some(mut record) = self.circuits.get_mut(service) else {
            return false;
        };
        let current = record.state;

        match current {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if record.forced_open {
                    record.rejected_requests += 1;
                    return true;
                }
                let next_attempt_at = record.next_attempt_at;
                match next_attempt_at {
                    Some(next_attempt) if now < next_attempt => {
                        record.rejected_requests += 1;
                        true
                    }
                    _ => {
                        record.state = CircuitState::HalfOpen;
                        record.next_attempt_at = None;
                        record.probe_started_at = Some(now);
                        info!(service = %service, "Circuit breaker transitioning to half-open");
                        false
                    }
                }
            }
            CircuitState::HalfOpen => {
                if self.config.half_open_policy == HalfOpenPolicy::MultipleProbes {
                    return false;
                }
                let probe_started_at = record.probe_started_at;
                match probe_started_at {
                    Some(started) if now - started < open_duration => {
                        record.rejected_requests += 1;
                        debug!(service = %service, "Half-open probe already in flight");
                        true
                    }
                    _ => {
                        record.probe_started_at = Some(now);
                        false
                    }
                }
            }
        }
    }

    /// Outcomes for services without a record are dropped, so a request that finishes after
    /// its service was removed cannot bring the record back.
    pub fn record_success(&self, service: &str) {
        let Some(mut record) = self.circuits.get_mut(service) else {
            debug!(service = %service, "Ignoring success for unregistered circuit");
            return;
        };
        record.success_count += 1;
        record.failure_count = 0;

        if record.state == CircuitState::HalfOpen {
            record.state = CircuitState::Closed;
            record.next_attempt_at = None;
            record.opened_at = None;
            record.probe_started_at = None;
            info!(service = %service, "Circuit breaker closing - service recovered");
        }
    }

    pub fn record_failure(&self, service: &str) {
        let now = self.clock.now();
        let Some(mut record) = self.circuits.get_mut(service) else {
            debug!(service = %service, "Ignoring failure for unregistered circuit");
            return;
        };
        record.failure_count = record.failure_count.saturating_add(1);
        record.total_failures += 1;
        record.last_failure_at = Some(now);
        let current = record.state;

        match current {
            CircuitState::Closed if record.failure_count >= self.config.failure_threshold => {
                self.trip(service, &mut record, now);
                warn!(
                    service = %service,
                    failures = record.failure_count,
                    "Circuit breaker opened after consecutive failures"
                );
            }
            CircuitState::HalfOpen => {
                self.trip(service, &mut record, now);
                warn!(service = %service, "Half-open probe failed, circuit breaker reopened");
            }
            _ => {}
        }
    }

    fn trip(&self, service: &str, record: &mut CircuitRecord, now: DateTime<Utc>) {
        record.state = CircuitState::Open;
        record.opened_at = Some(now);
        let next_attempt_at = now
            .checked_add_signed(to_chrono(self.config.open_duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        record.next_attempt_at = Some(next_attempt_at);
        record.probe_started_at = None;
        record.times_opened += 1;
        self.total_trips.fetch_add(1, Ordering::Relaxed);
        debug!(service = %service, next_attempt_at = ?record.next_attempt_at, "Circuit tripped");
    }

    /// Hold the circuit open until an operator closes or resets it
    pub fn force_open(&self, service: &str) {
        let now = self.clock.now();
        let mut record = self.circuits.entry(service.to_string()).or_default();
        if record.state != CircuitState::Open {
            record.times_opened += 1;
            self.total_trips.fetch_add(1, Ordering::Relaxed);
        }
        record.state = CircuitState::Open;
        record.forced_open = true;
        record.opened_at = Some(now);
        record.next_attempt_at = None;
        record.probe_started_at = None;
        warn!(service = %service, "Circuit breaker forced open by operator");
    }

    pub fn force_close(&self, service: &str) {
        let mut record = self.circuits.entry(service.to_string()).or_default();
        record.state = CircuitState::Closed;
        record.failure_count = 0;
        record.forced_open = false;
        record.opened_at = None;
        record.next_attempt_at = None;
        record.probe_started_at = None;
        warn!(service = %service, "Circuit breaker forced closed by operator");
    }

    /// Back to a fresh closed circuit with every counter zeroed
    pub fn reset(&self, service: &str) {
        self.circuits.insert(service.to_string(), CircuitRecord::default());
        warn!(service = %service, "Circuit breaker reset by operator");
    }

    pub fn get_state(&self, service: &str) -> Option<CircuitSnapshot> {
        self.circuits.get(service).map(|r| r.snapshot())
    }

    pub fn get_all_states(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn get_stats(&self) -> CircuitStats {
        let mut stats = CircuitStats {
            total_circuits: 0,
            closed: 0,
            open: 0,
            half_open: 0,
            total_failures: 0,
            total_successes: 0,
            total_trips: self.total_trips.load(Ordering::Relaxed),
            failure_threshold: self.config.failure_threshold,
            open_duration_ms: self.config.open_duration.as_millis() as u64,
            half_open_policy: self.config.half_open_policy,
        };

        for entry in self.circuits.iter() {
            let record = entry.value();
            stats.total_circuits += 1;
            match record.state {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
            stats.total_failures += record.total_failures;
            stats.total_successes += record.success_count;
        }

        stats
    }

    pub fn health_check(&self) -> BreakerHealth {
        let mut open_circuits = Vec::new();
        let mut half_open_circuits = Vec::new();
        for entry in self.circuits.iter() {
            match entry.value().state {
                CircuitState::Open => open_circuits.push(entry.key().clone()),
                CircuitState::HalfOpen => half_open_circuits.push(entry.key().clone()),
                CircuitState::Closed => {}
            }
        }
        open_circuits.sort();
        half_open_circuits.sort();

        BreakerHealth {
            healthy: open_circuits.is_empty(),
            detail: BreakerHealthDetail {
                total_circuits: self.circuits.len(),
                open_circuits,
                half_open_circuits,
            },
        }
    }
}
