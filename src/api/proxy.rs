//! Transparent proxy handler for `{routing_prefix}/{service}/{rest...}`

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::backend::http_backend::strip_hop_by_hop;
use crate::backend::traits::UpstreamRequest;
use crate::error::{ApiError, GatewayError};
use crate::gateway::router::RequestContext;
use crate::middleware::correlation::{CorrelationId, CORRELATION_HEADER};
use crate::AppState;

const ANONYMOUS_CLIENT: &str = "anonymous";

pub async fn proxy_request(
    State(state): State<Arc<AppState>>,
    correlation: CorrelationId,
    request: Request,
) -> Response {
    let correlation_id = correlation.0;
    let (parts, body) = request.into_parts();
    let gateway = &state.gateway;

    let Some((service, rest)) = gateway.resolve_path(parts.uri.path()) else {
        return not_found(&parts.uri, correlation_id);
    };

    let client_key = client_key(
        &parts.headers,
        &state.settings.gateway.client_id_header,
        parts.extensions.get::<ConnectInfo<SocketAddr>>(),
    );

    let body = match axum::body::to_bytes(body, state.settings.server.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            let error = GatewayError::InvalidRequest(format!("unreadable request body: {}", e));
            return ApiError::new(error, correlation_id).into_response();
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(CORRELATION_HEADER);

    let upstream_request = UpstreamRequest {
        method: parts.method,
        path: rest,
        query: parts.uri.query().map(str::to_string),
        headers,
        body,
    };

    let ctx = RequestContext::new(correlation_id, service);
    match gateway.dispatch(&ctx, &client_key, upstream_request, None).await {
        Ok(upstream) => {
            let mut headers = upstream.headers;
            strip_hop_by_hop(&mut headers);

            let mut response = Response::new(Body::from(upstream.body));
            *response.status_mut() = upstream.status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => ApiError::new(e, ctx.correlation_id).into_response(),
    }
}

/// Requests outside the routing namespace
pub async fn fallback(correlation: CorrelationId, uri: Uri) -> Response {
    not_found(&uri, correlation.0)
}

fn not_found(uri: &Uri, correlation_id: String) -> Response {
    ApiError::new(
        GatewayError::ServiceNotFound(uri.path().to_string()),
        correlation_id,
    )
    .into_response()
}

/// Rate-limit key: explicit client header, then the first forwarded address, then the
/// peer address
fn client_key(
    headers: &HeaderMap,
    client_id_header: &str,
    peer: Option<&ConnectInfo<SocketAddr>>,
) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    header(client_id_header)
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
                .filter(|ip| !ip.is_empty())
        })
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string())
}
