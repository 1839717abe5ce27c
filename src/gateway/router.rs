//! Gateway router: resolves the target service and runs the
//! rate limit -> circuit breaker -> forward -> record pipeline

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, Method};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::registry::ServiceRegistry;
use crate::backend::traits::{
    RateLimitPolicy, ServiceDescriptor, Upstream, UpstreamFailure, UpstreamRequest,
    UpstreamResponse,
};
use crate::error::{ErrorDetail, GatewayError, Result};
use crate::gateway::circuit_breaker::{CircuitBreakerManager, CircuitSnapshot};
use crate::gateway::rate_limit::RateLimiter;
use crate::middleware::correlation::{new_correlation_id, CORRELATION_HEADER};

/// Pure mapping applied to a service's outbound JSON request bodies
pub type RequestTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Client key used for in-process calls that carry no client header
pub const INTERNAL_CLIENT: &str = "internal";

/// Per-request context, alive for one request only
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub service: String,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(correlation_id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            service: service.into(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Default)]
struct ServiceCounters {
    requests: AtomicU64,
    forwarded: AtomicU64,
    succeeded: AtomicU64,
    upstream_failures: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
}

impl ServiceCounters {
    fn snapshot(&self) -> RequestCounters {
        RequestCounters {
            requests: self.requests.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Request counters of one service
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestCounters {
    pub requests: u64,
    pub forwarded: u64,
    pub succeeded: u64,
    pub upstream_failures: u64,
    pub rate_limited: u64,
    pub circuit_rejected: u64,
}

/// Operational metrics of one service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub circuit: Option<CircuitSnapshot>,
    pub rate_limit: RateLimitPolicy,
    pub requests: RequestCounters,
}

/// Structured outcome of a direct service call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub status_code: u16,
    pub response_time_ms: u64,
}

/// The gateway's single entry point for forwarding traffic to backend services
pub struct GatewayRouter {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    limiter: Arc<RateLimiter>,
    upstream: Arc<dyn Upstream>,
    transforms: DashMap<String, RequestTransform>,
    counters: DashMap<String, Arc<ServiceCounters>>,
    routing_prefix: String,
    shutdown: CancellationToken,
}

impl GatewayRouter {
    /// Create a router; every service already in the registry gets a breaker record
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        limiter: Arc<RateLimiter>,
        upstream: Arc<dyn Upstream>,
        routing_prefix: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        for name in registry.get_all_services() {
            breakers.register(&name);
        }

        let routing_prefix = routing_prefix.into().trim_end_matches('/').to_string();

        Self {
            registry,
            breakers,
            limiter,
            upstream,
            transforms: DashMap::new(),
            counters: DashMap::new(),
            routing_prefix,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn routing_prefix(&self) -> &str {
        &self.routing_prefix
    }

    /// False once shutdown has begun
    pub fn is_accepting(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Add a service at runtime
    pub fn register_service(&self, descriptor: ServiceDescriptor) -> Result<()> {
        let name = descriptor.name.clone();
        self.registry.register(descriptor)?;
        self.breakers.register(&name);
        Ok(())
    }

    /// Remove a service together with its breaker, rate-limit windows and transform
    pub fn deregister_service(&self, name: &str) -> bool {
        if self.registry.deregister(name).is_none() {
            return false;
        }
        self.breakers.remove(name);
        let windows = self.limiter.remove_service(name);
        self.transforms.remove(name);
        self.counters.remove(name);
        info!(service = %name, windows, "Removed service state");
        true
    }

    pub fn register_transform<F>(&self, service: &str, transform: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.insert(service.to_string(), Arc::new(transform));
    }

    /// Split a request path into the target service name and the path to forward.
    ///
    /// `/api/orders/items/7` resolves to `("orders", "/items/7")`. Returns `None` for paths
    /// outside the routing namespace or without a service segment.
    pub fn resolve_path(&self, path: &str) -> Option<(String, String)> {
        let rest = path.strip_prefix(self.routing_prefix.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let (service, remainder) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        if service.is_empty() {
            return None;
        }
        Some((service.to_string(), remainder.to_string()))
    }

    /// Run the shared pipeline for a request whose target service is `ctx.service`.
    ///
    /// Unknown services fail before any limiter or breaker state is touched. Rate-limit and
    /// open-circuit rejections never reach the backend and never touch the breaker.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        client_key: &str,
        mut request: UpstreamRequest,
        timeout_override: Option<Duration>,
    ) -> Result<UpstreamResponse> {
        if !self.is_accepting() {
            return Err(GatewayError::ShuttingDown);
        }

        let service = ctx.service.as_str();
        let descriptor = self
            .registry
            .get_service(service)
            .ok_or_else(|| GatewayError::ServiceNotFound(service.to_string()))?;
        let counters = self.counters_for(service);
        bump(&counters.requests);

        let decision = self
            .limiter
            .allow(service, client_key, &descriptor.rate_limit_policy);
        if !decision.permitted {
            bump(&counters.rate_limited);
            warn!(
                service = %service,
                correlation_id = %ctx.correlation_id,
                client = %client_key,
                retry_after_ms = decision.retry_after_ms,
                "Request rejected by rate limiter"
            );
            return Err(GatewayError::RateLimitExceeded {
                service: service.to_string(),
                retry_after_ms: decision.retry_after_ms,
            });
        }

        if self.breakers.is_open(service) {
            bump(&counters.circuit_rejected);
            warn!(
                service = %service,
                correlation_id = %ctx.correlation_id,
                "Request rejected, circuit breaker open"
            );
            return Err(GatewayError::CircuitOpen(service.to_string()));
        }

        request.body = self.apply_transform(service, &request.headers, request.body);
        if let Ok(value) = HeaderValue::from_str(&ctx.correlation_id) {
            request.headers.insert(CORRELATION_HEADER, value);
        }

        let timeout = timeout_override.unwrap_or(descriptor.request_timeout);
        bump(&counters.forwarded);

        let outcome = match tokio::time::timeout(
            timeout,
            self.upstream.send(&descriptor.base_address, request, timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(UpstreamFailure::Timeout),
        };

        match outcome {
            Ok(response) if response.status.is_server_error() => {
                self.breakers.record_failure(service);
                bump(&counters.upstream_failures);
                warn!(
                    service = %service,
                    correlation_id = %ctx.correlation_id,
                    status = response.status.as_u16(),
                    "Upstream returned server error"
                );
                Err(GatewayError::UpstreamError {
                    service: service.to_string(),
                    status: response.status.as_u16(),
                })
            }
            Ok(response) => {
                self.breakers.record_success(service);
                bump(&counters.succeeded);
                debug!(
                    service = %service,
                    status = response.status.as_u16(),
                    elapsed_ms = ctx.elapsed_ms(),
                    "Upstream request completed"
                );
                Ok(response)
            }
            Err(failure) => {
                self.breakers.record_failure(service);
                bump(&counters.upstream_failures);
                warn!(
                    service = %service,
                    correlation_id = %ctx.correlation_id,
                    error = %failure,
                    timeout_ms = timeout.as_millis() as u64,
                    "Upstream request failed"
                );
                Err(match failure {
                    UpstreamFailure::Timeout => GatewayError::UpstreamTimeout(service.to_string()),
                    UpstreamFailure::Unreachable(_) => {
                        GatewayError::UpstreamUnreachable(service.to_string())
                    }
                    UpstreamFailure::Transport(_) => GatewayError::UpstreamError {
                        service: service.to_string(),
                        status: 502,
                    },
                })
            }
        }
    }

    /// Call a service in-process, bypassing path-based routing.
    ///
    /// Runs the same pipeline as proxied requests and reports the outcome as data instead
    /// of an HTTP response.
    pub async fn call_service(
        &self,
        service: &str,
        endpoint: &str,
        method: Method,
        payload: Option<Value>,
        mut headers: HeaderMap,
        timeout_override: Option<Duration>,
    ) -> ServiceCallResult {
        let correlation_id = headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_correlation_id);
        let ctx = RequestContext::new(correlation_id, service);

        let body = match payload {
            Some(value) => {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                match serde_json::to_vec(&value) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => return Self::failed_call(&ctx, &GatewayError::Json(e)),
                }
            }
            None => Bytes::new(),
        };

        let (path, query) = match endpoint.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (endpoint, None),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let request = UpstreamRequest {
            method,
            path,
            query,
            headers,
            body,
        };

        match self.dispatch(&ctx, INTERNAL_CLIENT, request, timeout_override).await {
            Ok(response) => ServiceCallResult {
                success: response.status.is_success(),
                data: decode_body(&response.body),
                error: None,
                status_code: response.status.as_u16(),
                response_time_ms: ctx.elapsed_ms(),
            },
            Err(e) => Self::failed_call(&ctx, &e),
        }
    }

    fn failed_call(ctx: &RequestContext, error: &GatewayError) -> ServiceCallResult {
        ServiceCallResult {
            success: false,
            data: None,
            error: Some(ErrorDetail::from_error(error, &ctx.correlation_id)),
            status_code: error.status_code().as_u16(),
            response_time_ms: ctx.elapsed_ms(),
        }
    }

    fn apply_transform(&self, service: &str, headers: &HeaderMap, body: Bytes) -> Bytes {
        let Some(transform) = self.transforms.get(service).map(|t| t.clone()) else {
            return body;
        };
        if body.is_empty() || !is_json(headers) {
            return body;
        }

        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => match serde_json::to_vec(&transform(value)) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    warn!(service = %service, error = %e, "Transformed body could not be serialized");
                    body
                }
            },
            Err(_) => {
                debug!(service = %service, "Body is not valid JSON, skipping transform");
                body
            }
        }
    }

    fn counters_for(&self, service: &str) -> Arc<ServiceCounters> {
        self.counters
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    /// Breaker state, rate-limit policy and request counters of a service
    pub fn service_metrics(&self, service: &str) -> Option<ServiceMetrics> {
        let descriptor = self.registry.get_service(service)?;
        Some(ServiceMetrics {
            circuit: self.breakers.get_state(service),
            rate_limit: descriptor.rate_limit_policy,
            requests: self
                .counters
                .get(service)
                .map(|c| c.snapshot())
                .unwrap_or_default(),
        })
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

fn decode_body(body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body)
        .ok()
        .or_else(|| Some(Value::String(String::from_utf8_lossy(body).into_owned())))
}
