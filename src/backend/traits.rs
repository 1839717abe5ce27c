//! Common traits and types for upstream services

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::{GatewayError, Result};

/// Fixed-window quota applied per client of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub window_duration_ms: u64,
    pub max_requests_per_window: u32,
}

/// Static description of one backend service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_address: String,
    #[serde(with = "duration_ms", rename = "requestTimeoutMs")]
    pub request_timeout: Duration,
    pub health_check_path: String,
    pub rate_limit_policy: RateLimitPolicy,
}

impl ServiceDescriptor {
    /// URL of the service's health endpoint
    pub fn health_url(&self) -> String {
        join_url(&self.base_address, &self.health_check_path)
    }

    /// Reject descriptors the router and limiter cannot serve
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(GatewayError::InvalidRequest(format!(
                "Service '{}' {}",
                self.name, reason
            )))
        };

        if self.name.is_empty() || self.name.contains('/') {
            return invalid("must have a non-empty name without '/'");
        }
        if reqwest::Url::parse(&self.base_address).is_err() {
            return invalid("has an invalid base address");
        }
        if self.request_timeout.is_zero() {
            return invalid("must have a non-zero timeout");
        }
        if self.rate_limit_policy.window_duration_ms == 0
            || self.rate_limit_policy.max_requests_per_window == 0
        {
            return invalid("rate limit window and quota must be positive");
        }
        Ok(())
    }
}

/// Request about to be sent to a backend
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path relative to the service's base address, always starting with '/'
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response received from a backend
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Transport-level failure talking to a backend
#[derive(Debug, Error)]
pub enum UpstreamFailure {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Transport used to reach backend services
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a request to the service at `base_address`, bounded by `timeout`
    async fn send(
        &self,
        base_address: &str,
        request: UpstreamRequest,
        timeout: Duration,
    ) -> std::result::Result<UpstreamResponse, UpstreamFailure>;

    /// Issue a lightweight GET against a health endpoint and return its status
    async fn probe(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<StatusCode, UpstreamFailure>;
}

/// Join a base address and a path without doubling or dropping the slash
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
