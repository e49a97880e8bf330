//! Per-client HTTP rate limiting and CORS policy.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

use crate::metrics::HTTP_RATE_LIMITED_TOTAL;
use crate::websocket::rate_limit::SlidingWindowCounter;

/// Tracked clients before stale windows are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Fixed-window request counter keyed by client IP.
pub struct IngressLimiter {
    clients: Mutex<HashMap<IpAddr, SlidingWindowCounter>>,
    max_requests: u32,
    window: Duration,
}

impl IngressLimiter {
    /// Allow `max_requests` per `window` per client.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Count one request from `ip` at `now`; `false` once over the limit.
    pub fn check(&self, ip: IpAddr, now: Instant) -> bool {
        let mut clients = self.clients.lock();
        if clients.len() >= PRUNE_THRESHOLD {
            clients.retain(|_, counter| !counter.is_stale(now));
        }
        clients
            .entry(ip)
            .or_insert_with(|| SlidingWindowCounter::new(self.max_requests, self.window, now))
            .hit(now)
    }

    /// Clients currently tracked.
    pub fn tracked(&self) -> usize {
        self.clients.lock().len()
    }
}

/// Middleware answering 429 for clients over the ingress limit.
pub async fn limit_requests(
    State(limiter): State<Arc<IngressLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |info| info.0.ip());

    if limiter.check(ip, Instant::now()) {
        return next.run(request).await;
    }

    counter!(HTTP_RATE_LIMITED_TOTAL).increment(1);
    debug!(%ip, path = request.uri().path(), "http rate limit exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Too many requests, please try again later." })),
    )
        .into_response()
}

/// CORS policy for the HTTP routes. An empty list allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(origin, %error, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::middleware;
    use axum::routing::get;
    use tower::ServiceExt;

    const SECOND: Duration = Duration::from_secs(1);

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn limits_each_client_separately() {
        let limiter = IngressLimiter::new(2, SECOND);
        let now = Instant::now();
        assert!(limiter.check(ip(1), now));
        assert!(limiter.check(ip(1), now));
        assert!(!limiter.check(ip(1), now));
        assert!(limiter.check(ip(2), now));
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn window_resets() {
        let limiter = IngressLimiter::new(1, SECOND);
        let now = Instant::now();
        assert!(limiter.check(ip(1), now));
        assert!(!limiter.check(ip(1), now));
        assert!(limiter.check(ip(1), now + Duration::from_millis(1001)));
    }

    #[test]
    fn stale_clients_pruned() {
        let limiter = IngressLimiter::new(1, SECOND);
        let now = Instant::now();
        for i in 0..PRUNE_THRESHOLD {
            let addr = IpAddr::V6(std::net::Ipv6Addr::from(u128::try_from(i).unwrap()));
            let _ = limiter.check(addr, now);
        }
        assert_eq!(limiter.tracked(), PRUNE_THRESHOLD);
        let _ = limiter.check(ip(1), now + Duration::from_secs(5));
        assert_eq!(limiter.tracked(), 1);
    }

    fn app(max: u32) -> Router {
        let limiter = Arc::new(IngressLimiter::new(max, SECOND));
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn_with_state(limiter, limit_requests))
    }

    #[tokio::test]
    async fn middleware_returns_429_json() {
        let app = app(1);
        let req = || HttpRequest::builder().uri("/ping").body(Body::empty()).unwrap();

        let ok = app.clone().oneshot(req()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let limited = app.oneshot(req()).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(limited.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["error"].is_string());
    }

    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(cors_layer(&["https://app.example.com".into()]));
        let req = HttpRequest::builder()
            .uri("/ping")
            .header("origin", "https://app.example.com")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "https://app.example.com"
        );
    }

    #[tokio::test]
    async fn cors_permissive_when_unconfigured() {
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(cors_layer(&[]));
        let req = HttpRequest::builder()
            .uri("/ping")
            .header("origin", "https://anywhere.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    }
}
