//! Admission control and response caching as one ordered middleware chain.
//!
//! Per request: admission check, then (GET only) cache lookup, then the
//! downstream handler with its body captured, then the cache commit.
//! Admission always runs first, so a denied client never touches the cache.

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{ResponseCache, ResponseCapture, cache_key};
use crate::error::ApiError;
use crate::metrics::RATE_LIMITED;
use crate::middleware::client_identity;
use crate::registry::ClientRegistry;

/// Response extension marking a request that was cut short by a middleware.
///
/// Marked responses are never cached, whatever their status.
#[derive(Debug, Clone, Copy)]
pub struct Aborted;

#[derive(Clone)]
pub struct GatewayPipeline {
    registry: Arc<ClientRegistry>,
    cache: ResponseCache,
    trusted_proxies: Arc<[IpAddr]>,
}

impl GatewayPipeline {
    pub fn new(registry: Arc<ClientRegistry>, cache: ResponseCache) -> Self {
        Self {
            registry,
            cache,
            trusted_proxies: Arc::from(Vec::new()),
        }
    }

    /// Peers whose `X-Forwarded-For` header is honoured for client identity.
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = Arc::from(proxies);
        self
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn trusted_proxies(&self) -> Arc<[IpAddr]> {
        Arc::clone(&self.trusted_proxies)
    }

    /// Install the chain ahead of every route already in `router`.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        // last layer added runs first
        router
            .layer(middleware::from_fn_with_state(self.clone(), response_cache))
            .layer(middleware::from_fn_with_state(self.clone(), admission_control))
    }
}

async fn admission_control(State(pipeline): State<GatewayPipeline>, req: Request, next: Next) -> Response {
    let identity = client_identity(&req, &pipeline.trusted_proxies);

    if !pipeline.registry.admit(&identity) {
        RATE_LIMITED.inc();
        let wait = pipeline.registry.retry_after(&identity);
        let retry_after = (wait.as_secs_f64().ceil() as u64).max(1);

        let mut response = ApiError::RateLimited { retry_after }.into_response();
        response.extensions_mut().insert(Aborted);
        return response;
    }

    next.run(req).await
}

async fn response_cache(State(pipeline): State<GatewayPipeline>, req: Request, next: Next) -> Response {
    let cache = &pipeline.cache;
    if req.method() != Method::GET || !cache.is_enabled() {
        return next.run(req).await;
    }

    let key = cache_key(req.method(), req.uri());
    if let Some(entry) = cache.lookup(&key).await {
        return entry.into_response();
    }

    let response = next.run(req).await;

    if !response.status().is_success() {
        return response;
    }
    if response.extensions().get::<Aborted>().is_some() {
        debug!(key = %key, "Response aborted, not caching");
        return response;
    }

    let (parts, body) = response.into_parts();
    let capture = ResponseCapture::new(body, cache.clone(), key, parts.status, parts.headers.clone());
    Response::from_parts(parts, Body::new(capture))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::config::{CacheSettings, RateLimitSettings};
    use axum::http::{StatusCode, header};
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn pipeline(burst: u32) -> GatewayPipeline {
        let settings = RateLimitSettings::new(60, burst, Duration::from_secs(300)).unwrap();
        let cache = ResponseCache::new(
            Arc::new(MemoryStore::new()),
            CacheSettings {
                ttl: Duration::from_secs(60),
                lookup_timeout: Duration::from_millis(100),
            },
        );
        GatewayPipeline::new(Arc::new(ClientRegistry::new(settings)), cache)
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_denied_response_is_marked_and_has_retry_after() {
        let app = pipeline(1).apply(Router::new().route("/", get(|| async { "ok" })));

        let first = app.clone().oneshot(get_request("/")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let denied = app.oneshot(get_request("/")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()[header::RETRY_AFTER], "1");
        assert!(denied.extensions().get::<Aborted>().is_some());
    }

    #[tokio::test]
    async fn test_aborted_success_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut response = "partial".into_response();
                response.extensions_mut().insert(Aborted);
                response
            }
        };
        let app = pipeline(10).apply(Router::new().route("/", get(handler)));

        for _ in 0..2 {
            let response = app.clone().oneshot(get_request("/")).await.unwrap();
            axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
