//! Liveness, health, metrics and operator endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::backend::registry::{HealthRecord, RegistrySnapshot};
use crate::error::{ApiError, GatewayError};
use crate::gateway::circuit_breaker::{BreakerHealth, CircuitSnapshot, CircuitStats};
use crate::gateway::router::ServiceMetrics;
use crate::middleware::correlation::CorrelationId;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub open_circuits: Vec<String>,
}

/// `GET /health`: healthy iff no circuit is open
pub async fn liveness(State(state): State<Arc<AppState>>) -> Response {
    let breakers = state.gateway.breakers().health_check();
    let status = if state.is_shutting_down() {
        "shutting_down"
    } else if breakers.healthy {
        "healthy"
    } else {
        "degraded"
    };
    let code = if state.is_shutting_down() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = LivenessResponse {
        status,
        uptime_secs: state.uptime().as_secs(),
        started_at: state.started_at,
        open_circuits: breakers.detail.open_circuits,
    };
    (code, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthView {
    pub name: String,
    pub base_address: String,
    pub health: HealthRecord,
    pub circuit: Option<CircuitSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOverview {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub breakers: BreakerHealth,
    pub services: Vec<ServiceHealthView>,
}

fn service_health_view(state: &AppState, name: &str, health: HealthRecord) -> Option<ServiceHealthView> {
    let descriptor = state.gateway.registry().get_service(name)?;
    Some(ServiceHealthView {
        name: name.to_string(),
        base_address: descriptor.base_address.clone(),
        health,
        circuit: state.gateway.breakers().get_state(name),
    })
}

/// `GET /admin/health`
pub async fn health_overview(State(state): State<Arc<AppState>>) -> Json<HealthOverview> {
    let registry = state.gateway.registry();
    let stats = registry.get_service_stats();
    let services = registry
        .get_all_services()
        .iter()
        .filter_map(|name| {
            let health = registry.get_health(name).unwrap_or_default();
            service_health_view(&state, name, health)
        })
        .collect();

    Json(HealthOverview {
        total: stats.total,
        healthy: stats.healthy,
        degraded: stats.degraded,
        unhealthy: stats.unhealthy,
        breakers: state.gateway.breakers().health_check(),
        services,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub refresh: bool,
}

/// `GET /admin/health/:service`, probing first when `?refresh=true`
pub async fn service_health(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    Query(query): Query<HealthQuery>,
    correlation: CorrelationId,
) -> Result<Json<ServiceHealthView>, ApiError> {
    let registry = state.gateway.registry();
    let health = if query.refresh {
        registry
            .check_service_health(&service)
            .await
            .map_err(|e| ApiError::new(e, correlation.0.clone()))?
    } else {
        registry
            .get_health(&service)
            .ok_or_else(|| not_found(&service, &correlation))?
    };

    service_health_view(&state, &service, health)
        .map(Json)
        .ok_or_else(|| not_found(&service, &correlation))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub accepting_requests: bool,
    pub circuits: CircuitStats,
    pub rate_limit_windows: usize,
    pub services: BTreeMap<String, ServiceMetrics>,
}

/// `GET /admin/metrics`
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let gateway = &state.gateway;
    let services = gateway
        .registry()
        .get_all_services()
        .into_iter()
        .filter_map(|name| gateway.service_metrics(&name).map(|m| (name, m)))
        .collect();

    Json(MetricsResponse {
        uptime_secs: state.uptime().as_secs(),
        started_at: state.started_at,
        accepting_requests: gateway.is_accepting(),
        circuits: gateway.breakers().get_stats(),
        rate_limit_windows: gateway.limiter().window_count(),
        services,
    })
}

/// `GET /admin/registry`
pub async fn registry(State(state): State<Arc<AppState>>) -> Json<RegistrySnapshot> {
    Json(state.gateway.registry().get_registry_snapshot())
}

#[derive(Debug, Serialize)]
pub struct CircuitsResponse {
    pub stats: CircuitStats,
    pub health: BreakerHealth,
    pub circuits: BTreeMap<String, CircuitSnapshot>,
}

/// `GET /admin/circuits`
pub async fn circuits(State(state): State<Arc<AppState>>) -> Json<CircuitsResponse> {
    let breakers = state.gateway.breakers();
    Json(CircuitsResponse {
        stats: breakers.get_stats(),
        health: breakers.health_check(),
        circuits: breakers.get_all_states(),
    })
}

#[derive(Debug, Clone, Copy)]
enum Override {
    Open,
    Close,
    Reset,
}

fn apply_override(
    state: &AppState,
    service: &str,
    action: Override,
    correlation: &CorrelationId,
) -> Result<Json<CircuitSnapshot>, ApiError> {
    let breakers = state.gateway.breakers();
    if breakers.get_state(service).is_none() {
        return Err(not_found(service, correlation));
    }

    warn!(
        service = %service,
        action = ?action,
        correlation_id = %correlation.as_str(),
        "Operator circuit override"
    );
    match action {
        Override::Open => breakers.force_open(service),
        Override::Close => breakers.force_close(service),
        Override::Reset => breakers.reset(service),
    }

    breakers
        .get_state(service)
        .map(Json)
        .ok_or_else(|| not_found(service, correlation))
}

/// `POST /admin/circuits/:service/open`
pub async fn force_open(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    correlation: CorrelationId,
) -> Result<Json<CircuitSnapshot>, ApiError> {
    apply_override(&state, &service, Override::Open, &correlation)
}

/// `POST /admin/circuits/:service/close`
pub async fn force_close(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    correlation: CorrelationId,
) -> Result<Json<CircuitSnapshot>, ApiError> {
    apply_override(&state, &service, Override::Close, &correlation)
}

/// `POST /admin/circuits/:service/reset`
pub async fn reset(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    correlation: CorrelationId,
) -> Result<Json<CircuitSnapshot>, ApiError> {
    apply_override(&state, &service, Override::Reset, &correlation)
}

fn not_found(service: &str, correlation: &CorrelationId) -> ApiError {
    ApiError::new(
        GatewayError::ServiceNotFound(service.to_string()),
        correlation.as_str(),
    )
}
