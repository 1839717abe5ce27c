//! Tests for in-process service calls

#[path = "../common/mod.rs"]
mod common;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use circuit_gateway::backend::traits::{RateLimitPolicy, ServiceDescriptor};
use circuit_gateway::gateway::circuit_breaker::CircuitState;
use common::{gateway, limited_service, service};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_call_service_returns_json_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"sku": "A-1", "qty": 2})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 99})))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    let result = gw
        .state
        .gateway
        .call_service(
            "orders",
            "orders",
            Method::POST,
            Some(json!({"sku": "A-1", "qty": 2})),
            HeaderMap::new(),
            None,
        )
        .await;

    assert!(result.success);
    assert_eq!(result.status_code, 201);
    assert_eq!(result.data, Some(json!({"id": 99})));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_call_service_keeps_caller_correlation_id() {
    let server = MockServer::start().await;
    Mock::given(path("/ping"))
        .and(header("x-correlation-id", "job-7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    let mut headers = HeaderMap::new();
    headers.insert("x-correlation-id", HeaderValue::from_static("job-7"));

    let result = gw
        .state
        .gateway
        .call_service("orders", "/ping", Method::GET, None, headers, None)
        .await;

    assert!(result.success);
    assert_eq!(result.data, Some(json!("pong")));
}

#[tokio::test]
async fn test_timeout_override_applies() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    let result = gw
        .state
        .gateway
        .call_service(
            "orders",
            "/slow",
            Method::GET,
            None,
            HeaderMap::new(),
            Some(Duration::from_millis(50)),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.status_code, StatusCode::GATEWAY_TIMEOUT.as_u16());
    let error = result.error.unwrap();
    assert_eq!(error.code, "UPSTREAM_TIMEOUT");
    assert_eq!(error.service.as_deref(), Some("orders"));
}

#[tokio::test]
async fn test_direct_and_proxied_calls_share_the_breaker() {
    let server = MockServer::start().await;
    Mock::given(path("/x"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    for _ in 0..3 {
        gw.state
            .gateway
            .call_service("orders", "/x", Method::GET, None, HeaderMap::new(), None)
            .await;
    }
    for _ in 0..2 {
        gw.get("/api/orders/x").await;
    }

    assert_eq!(
        gw.state.gateway.breakers().get_state("orders").unwrap().state,
        CircuitState::Open
    );
    let result = gw
        .state
        .gateway
        .call_service("orders", "/x", Method::GET, None, HeaderMap::new(), None)
        .await;
    assert_eq!(result.status_code, 503);
    assert_eq!(result.error.unwrap().code, "CIRCUIT_OPEN");
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_direct_calls_are_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let gw = gateway(vec![limited_service("payments", &server.uri(), 1, 10_000)]);
    let router = &gw.state.gateway;

    let first = router
        .call_service("payments", "/", Method::GET, None, HeaderMap::new(), None)
        .await;
    assert!(first.success);
    let rejected = router
        .call_service("payments", "/", Method::GET, None, HeaderMap::new(), None)
        .await;
    assert_eq!(rejected.status_code, 429);
    let error = rejected.error.unwrap();
    assert_eq!(error.code, "RATE_LIMIT_EXCEEDED");
    assert_eq!(error.retry_after_ms, Some(10_000));
}

#[tokio::test]
async fn test_unknown_service_result() {
    let gw = gateway(vec![]);
    let result = gw
        .state
        .gateway
        .call_service("ghost", "/", Method::GET, None, HeaderMap::new(), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.status_code, 404);
    assert_eq!(result.error.unwrap().code, "SERVICE_NOT_FOUND");
}

#[tokio::test]
async fn test_runtime_registration_and_removal() {
    let server = MockServer::start().await;
    Mock::given(path("/v1/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let gw = gateway(vec![]);
    gw.state
        .gateway
        .register_service(ServiceDescriptor {
            name: "search".to_string(),
            base_address: format!("{}/v1", server.uri()),
            request_timeout: Duration::from_secs(1),
            health_check_path: "/health".to_string(),
            rate_limit_policy: RateLimitPolicy {
                window_duration_ms: 1_000,
                max_requests_per_window: 10,
            },
        })
        .unwrap();

    assert_eq!(gw.get("/api/search/ping").await.status(), StatusCode::OK);
    assert!(gw.state.gateway.breakers().get_state("search").is_some());

    assert!(gw.state.gateway.deregister_service("search"));
    assert_eq!(gw.get("/api/search/ping").await.status(), StatusCode::NOT_FOUND);
    assert!(gw.state.gateway.breakers().get_state("search").is_none());
    assert_eq!(gw.state.gateway.limiter().window_count(), 0);
}

#[tokio::test]
async fn test_transform_rewrites_outbound_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_json(json!({"sku": "A-1", "channel": "web"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    gw.state.gateway.register_transform("orders", |mut body| {
        body["channel"] = json!("web");
        body
    });

    let result = gw
        .state
        .gateway
        .call_service(
            "orders",
            "/orders",
            Method::POST,
            Some(json!({"sku": "A-1"})),
            HeaderMap::new(),
            None,
        )
        .await;
    assert!(result.success);
}
