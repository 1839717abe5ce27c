//! Functional tests for rate limiting

#[path = "../common/mod.rs"]
mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{gateway, json_body, limited_service};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_rate_limit_allows_within_limit() {
    let server = upstream().await;
    let gw = gateway(vec![limited_service("payments", &server.uri(), 100, 60_000)]);

    let response = gw.get_as("/api/payments/test", "client-a").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_health_bypass() {
    let server = upstream().await;
    let gw = gateway(vec![limited_service("payments", &server.uri(), 1, 60_000)]);

    gw.get_as("/api/payments/test", "client-a").await;
    assert_eq!(
        gw.get_as("/api/payments/test", "client-a").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    // Liveness is never rate limited
    for _ in 0..5 {
        assert_eq!(gw.get("/health").await.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_rate_limit_metrics_bypass() {
    let server = upstream().await;
    let gw = gateway(vec![limited_service("payments", &server.uri(), 1, 60_000)]);

    gw.get_as("/api/payments/test", "client-a").await;

    for _ in 0..5 {
        assert_eq!(gw.get("/admin/metrics").await.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_rate_limit_exceeded() {
    let server = upstream().await;
    let gw = gateway(vec![limited_service("payments", &server.uri(), 2, 5_000)]);

    for _ in 0..2 {
        assert_eq!(
            gw.get_as("/api/payments/test", "client-a").await.status(),
            StatusCode::OK
        );
    }

    gw.clock.advance(Duration::from_millis(1_500));
    let response = gw.get_as("/api/payments/test", "client-a").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    // 3.5s left in the window, rounded up to whole seconds
    assert_eq!(response.headers()["retry-after"], "4");

    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["error"]["retryAfterMs"], 3_500);
}

#[tokio::test]
async fn test_rate_limit_resets_with_new_window() {
    let server = upstream().await;
    let gw = gateway(vec![limited_service("payments", &server.uri(), 1, 1_000)]);

    assert_eq!(
        gw.get_as("/api/payments/test", "client-a").await.status(),
        StatusCode::OK
    );
    for _ in 0..3 {
        assert_eq!(
            gw.get_as("/api/payments/test", "client-a").await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    gw.clock.advance(Duration::from_millis(1_000));
    assert_eq!(
        gw.get_as("/api/payments/test", "client-a").await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_rate_limit_is_per_client() {
    let server = upstream().await;
    let gw = gateway(vec![limited_service("payments", &server.uri(), 1, 60_000)]);

    assert_eq!(
        gw.get_as("/api/payments/test", "client-a").await.status(),
        StatusCode::OK
    );
    assert_eq!(
        gw.get_as("/api/payments/test", "client-b").await.status(),
        StatusCode::OK
    );
    assert_eq!(
        gw.get_as("/api/payments/test", "client-a").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_forwarded_for_identifies_client() {
    let server = upstream().await;
    let gw = gateway(vec![limited_service("payments", &server.uri(), 1, 60_000)]);

    let request = |ip: &'static str| {
        Request::builder()
            .uri("/api/payments/test")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    let first = gw.app.clone().oneshot(request("203.0.113.7")).await.unwrap();
    let other = gw.app.clone().oneshot(request("203.0.113.8")).await.unwrap();
    let repeat = gw.app.clone().oneshot(request("203.0.113.7")).await.unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(repeat.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_rate_limit_is_per_service() {
    let server = upstream().await;
    let gw = gateway(vec![
        limited_service("payments", &server.uri(), 1, 60_000),
        limited_service("orders", &server.uri(), 1, 60_000),
    ]);

    assert_eq!(
        gw.get_as("/api/payments/test", "client-a").await.status(),
        StatusCode::OK
    );
    assert_eq!(
        gw.get_as("/api/orders/test", "client-a").await.status(),
        StatusCode::OK
    );
}
