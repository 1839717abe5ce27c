//! End-to-end tests for the proxy pipeline

#[path = "../common/mod.rs"]
mod common;

use axum::{body::Body, http::{Method, Request, StatusCode}};
use circuit_gateway::gateway::circuit_breaker::CircuitState;
use common::{gateway, json_body, limited_service, service, text_body};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_breaker_opens_after_threshold_failures() {
    let server = MockServer::start().await;
    Mock::given(path("/items"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);

    for _ in 0..5 {
        let response = gw.get("/api/orders/items").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
        assert_eq!(body["error"]["service"], "orders");
    }

    let response = gw.get("/api/orders/items").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "CIRCUIT_OPEN");
    assert_eq!(body["error"]["service"], "orders");

    // The sixth request never reached the backend
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_breaker_recovers_after_cool_down() {
    let server = MockServer::start().await;
    Mock::given(path("/items"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    for _ in 0..5 {
        gw.get("/api/orders/items").await;
    }
    assert_eq!(
        gw.get("/api/orders/items").await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    server.reset().await;
    Mock::given(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    gw.clock.advance(Duration::from_secs(61));

    let probe = gw.get("/api/orders/items").await;
    assert_eq!(probe.status(), StatusCode::OK);
    let follow_up = gw.get("/api/orders/items").await;
    assert_eq!(follow_up.status(), StatusCode::OK);

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    let snapshot = gw.state.gateway.breakers().get_state("orders").unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test]
async fn test_failed_probe_reopens_circuit() {
    let server = MockServer::start().await;
    Mock::given(path("/items"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    for _ in 0..5 {
        gw.get("/api/orders/items").await;
    }

    gw.clock.advance(Duration::from_secs(60));
    assert_eq!(gw.get("/api/orders/items").await.status(), StatusCode::BAD_GATEWAY);

    let response = gw.get("/api/orders/items").await;
    assert_eq!(json_body(response).await["error"]["code"], "CIRCUIT_OPEN");
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
    assert_eq!(
        gw.state.gateway.breakers().get_state("orders").unwrap().state,
        CircuitState::Open
    );
}

#[tokio::test]
async fn test_rate_limit_rejects_over_quota() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let gw = gateway(vec![limited_service("payments", &server.uri(), 3, 1000)]);

    for _ in 0..3 {
        let response = gw.get_as("/api/payments/charge", "client-a").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = gw.get_as("/api/payments/charge", "client-a").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "1");
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["error"]["service"], "payments");
    let retry_after_ms = body["error"]["retryAfterMs"].as_u64().unwrap();
    assert!(retry_after_ms > 0 && retry_after_ms <= 1000);

    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    // Rate-limit rejections never count against the breaker
    let snapshot = gw.state.gateway.breakers().get_state("payments").unwrap();
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.success_count, 3);
}

#[tokio::test]
async fn test_unknown_service_creates_no_state() {
    let gw = gateway(vec![service("orders", "http://127.0.0.1:1")]);

    let response = gw.get("/api/unknown-service/x").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "SERVICE_NOT_FOUND");
    assert!(body["error"]["correlationId"].is_string());

    assert!(gw.state.gateway.breakers().get_state("unknown-service").is_none());
    assert_eq!(gw.state.gateway.limiter().window_count(), 0);
}

#[tokio::test]
async fn test_paths_outside_namespace_are_not_found() {
    let gw = gateway(vec![service("orders", "http://127.0.0.1:1")]);

    for uri in ["/orders/items", "/api", "/api/"] {
        let response = gw.get(uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {}", uri);
        assert_eq!(json_body(response).await["error"]["code"], "SERVICE_NOT_FOUND");
    }
}

#[tokio::test]
async fn test_request_is_forwarded_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/items/7"))
        .and(query_param("expand", "lines"))
        .and(header("x-tenant", "acme"))
        .and(body_string("payload"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-upstream", "orders")
                .set_body_string("created"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    let response = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/orders/items/7?expand=lines")
                .header("x-tenant", "acme")
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-upstream"], "orders");
    assert!(response.headers().contains_key("x-correlation-id"));
    assert_eq!(text_body(response).await, "created");
}

#[tokio::test]
async fn test_client_errors_pass_through_as_success() {
    let server = MockServer::start().await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such order"))
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    for _ in 0..6 {
        let response = gw.get("/api/orders/missing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(text_body(response).await, "no such order");
    }

    let snapshot = gw.state.gateway.breakers().get_state("orders").unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.success_count, 6);
}

#[tokio::test]
async fn test_upstream_timeout_counts_as_failure() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let mut orders = service("orders", &server.uri());
    orders.timeout_ms = 100;
    let gw = gateway(vec![orders]);

    let started = std::time::Instant::now();
    let response = gw.get("/api/orders/slow").await;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["error"]["code"], "UPSTREAM_TIMEOUT");
    assert_eq!(
        gw.state.gateway.breakers().get_state("orders").unwrap().failure_count,
        1
    );
}

#[tokio::test]
async fn test_unreachable_upstream_counts_as_failure() {
    let gw = gateway(vec![service("orders", "http://127.0.0.1:1")]);

    let response = gw.get("/api/orders/items").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "UPSTREAM_UNREACHABLE");
    assert_eq!(
        gw.state.gateway.breakers().get_state("orders").unwrap().failure_count,
        1
    );
}

#[tokio::test]
async fn test_correlation_id_is_propagated_and_echoed() {
    let server = MockServer::start().await;
    Mock::given(path("/items"))
        .and(header("x-correlation-id", "trace-42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(vec![service("orders", &server.uri())]);
    let response = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/orders/items")
                .header("x-correlation-id", "trace-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-correlation-id"], "trace-42");
}

#[tokio::test]
async fn test_error_bodies_carry_the_echoed_correlation_id() {
    let gw = gateway(vec![service("orders", "http://127.0.0.1:1")]);
    let response = gw.get("/api/nope/x").await;

    let echoed = response.headers()["x-correlation-id"]
        .to_str()
        .unwrap()
        .to_string();
    let body = json_body(response).await;
    assert_eq!(body["error"]["correlationId"], echoed.as_str());
}

#[tokio::test]
async fn test_services_are_isolated() {
    let failing = MockServer::start().await;
    Mock::given(path("/x"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&failing)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let gw = gateway(vec![
        service("orders", &failing.uri()),
        service("users", &healthy.uri()),
    ]);
    for _ in 0..5 {
        gw.get("/api/orders/x").await;
    }

    assert_eq!(
        gw.get("/api/orders/x").await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(gw.get("/api/users/x").await.status(), StatusCode::OK);
}
