//! Route table of the gateway

use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{admin, proxy};
use crate::middleware::correlation::CorrelationLayer;
use crate::AppState;

/// Build the axum router: admin endpoints, the proxy namespace and a JSON 404 fallback
pub fn create_router(state: Arc<AppState>) -> Router {
    let proxy_route = format!("{}/*rest", state.gateway.routing_prefix());

    Router::new()
        .route("/health", get(admin::liveness))
        .route("/admin/health", get(admin::health_overview))
        .route("/admin/health/:service", get(admin::service_health))
        .route("/admin/metrics", get(admin::metrics))
        .route("/admin/registry", get(admin::registry))
        .route("/admin/circuits", get(admin::circuits))
        .route("/admin/circuits/:service/open", post(admin::force_open))
        .route("/admin/circuits/:service/close", post(admin::force_close))
        .route("/admin/circuits/:service/reset", post(admin::reset))
        .route(&proxy_route, any(proxy::proxy_request))
        .fallback(proxy::fallback)
        .layer(CorrelationLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
