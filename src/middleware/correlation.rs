//! Correlation id middleware
//!
//! Every request gets a correlation id: the caller's `x-correlation-id` when it is usable,
//! a fresh uuid otherwise. The id is stored as a request extension, attached to the request
//! span and echoed on the response.

use axum::{
    async_trait,
    body::Body,
    extract::FromRequestParts,
    http::{request::Parts, HeaderValue, Request},
    response::Response,
};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Correlation id of the current request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Handlers outside the correlation layer still get a usable id
#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CorrelationId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<CorrelationId>()
            .cloned()
            .unwrap_or_else(|| CorrelationId(new_correlation_id())))
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Accept a caller-supplied id only if it is non-empty, bounded and visible ASCII
fn accept_incoming(value: &HeaderValue) -> Option<String> {
    let value = value.to_str().ok()?;
    let valid = !value.is_empty()
        && value.len() <= MAX_CORRELATION_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic());
    valid.then(|| value.to_string())
}

#[derive(Clone, Default)]
pub struct CorrelationLayer;

impl CorrelationLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationMiddleware { inner }
    }
}

#[derive(Clone)]
pub struct CorrelationMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for CorrelationMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let correlation_id = request
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(accept_incoming)
            .unwrap_or_else(new_correlation_id);

        request
            .extensions_mut()
            .insert(CorrelationId(correlation_id.clone()));

        let span = info_span!(
            "request",
            correlation_id = %correlation_id,
            method = %request.method(),
            path = %request.uri().path(),
        );
        let future = self.inner.call(request);

        Box::pin(
            async move {
                let mut response = future.await?;
                if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                    response.headers_mut().insert(CORRELATION_HEADER, value);
                }
                Ok(response)
            }
            .instrument(span),
        )
    }
}
