//! Common error types for the gateway

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Rate limit exceeded for service '{service}', retry after {retry_after_ms}ms")]
    RateLimitExceeded { service: String, retry_after_ms: u64 },

    #[error("Circuit breaker is open for service '{0}'")]
    CircuitOpen(String),

    #[error("Upstream service '{0}' timed out")]
    UpstreamTimeout(String),

    #[error("Upstream service '{service}' returned an error (status {status})")]
    UpstreamError { service: String, status: u16 },

    #[error("Upstream service '{0}' is unreachable")]
    UpstreamUnreachable(String),

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Machine-readable code used in error bodies
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamError { .. } | GatewayError::HttpClient(_) => "UPSTREAM_ERROR",
            GatewayError::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            GatewayError::ShuttingDown => "GATEWAY_SHUTTING_DOWN",
            GatewayError::InvalidRequest(_) | GatewayError::Json(_) => "INVALID_REQUEST",
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamError { .. } | GatewayError::HttpClient(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::UpstreamUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRequest(_) | GatewayError::Json(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Service the error refers to, when there is one
    pub fn service(&self) -> Option<&str> {
        match self {
            GatewayError::ServiceNotFound(s)
            | GatewayError::CircuitOpen(s)
            | GatewayError::UpstreamTimeout(s)
            | GatewayError::UpstreamUnreachable(s) => Some(s),
            GatewayError::RateLimitExceeded { service, .. }
            | GatewayError::UpstreamError { service, .. } => Some(service),
            _ => None,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Message safe to hand to callers. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                "Internal gateway error".to_string()
            }
            GatewayError::HttpClient(_) => "Upstream request failed".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorDetail {
    pub fn from_error(error: &GatewayError, correlation_id: &str) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.public_message(),
            service: error.service().map(str::to_string),
            correlation_id: correlation_id.to_string(),
            retry_after_ms: error.retry_after_ms(),
        }
    }
}

/// A gateway error bound to the request it happened in
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub correlation_id: String,
}

impl ApiError {
    pub fn new(error: GatewayError, correlation_id: impl Into<String>) -> Self {
        Self {
            error,
            correlation_id: correlation_id.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let retry_after_ms = self.error.retry_after_ms();
        let body = Json(ErrorResponse {
            error: ErrorDetail::from_error(&self.error, &self.correlation_id),
        });

        let mut response = (status, body).into_response();
        if let Some(ms) = retry_after_ms {
            let secs = ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GatewayError>;
