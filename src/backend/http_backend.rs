//! HTTP transport to backend services

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use reqwest::{redirect, Client};
use std::time::Duration;
use tracing::debug;

use crate::backend::traits::{join_url, Upstream, UpstreamFailure, UpstreamRequest, UpstreamResponse};
use crate::error::{GatewayError, Result};

/// Headers that only make sense for a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// reqwest-backed upstream transport, shared by all services
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
}

impl HttpUpstream {
    /// Create a new HTTP transport
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(
        &self,
        base_address: &str,
        request: UpstreamRequest,
        timeout: Duration,
    ) -> std::result::Result<UpstreamResponse, UpstreamFailure> {
        let mut url = join_url(base_address, &request.path);
        if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        debug!(url = %url, method = %request.method, "Forwarding request upstream");

        let response = self
            .client
            .request(request.method, &url)
            .headers(request.headers)
            .body(request.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    async fn probe(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<StatusCode, UpstreamFailure> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;
        Ok(response.status())
    }
}

fn classify(error: reqwest::Error) -> UpstreamFailure {
    if error.is_timeout() {
        UpstreamFailure::Timeout
    } else if error.is_connect() {
        UpstreamFailure::Unreachable(error.to_string())
    } else {
        UpstreamFailure::Transport(error.to_string())
    }
}

/// Drop hop-by-hop headers, `host` and `content-length` before relaying a message
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop as well
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
}
