use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::rate_limiter::RateLimiter;
use crate::engine::reaper::spawn_sweep;

/// A bucket untouched this long has refilled completely in every tier, so
/// dropping it loses nothing.
pub const LIMITER_IDLE: Duration = Duration::from_secs(10 * 60);

/// Per-IP rate limiters for different endpoint tiers.
pub struct ApiRateLimiters {
    /// Public read endpoints. Burst of 60, refill 1 per second.
    pub api: RateLimiter,
    /// WebSocket connections: prevent connection storms.
    /// Burst of 5, refill 1 per 12 seconds (~5/minute).
    pub ws: RateLimiter,
    /// Admin endpoints: tight limit against password guessing.
    /// Burst of 10, refill 1 per 6 seconds (~10/minute).
    pub admin: RateLimiter,
    /// Media server callbacks. Burst of 50, refill 5 per second.
    pub webhook: RateLimiter,
}

impl Default for ApiRateLimiters {
    fn default() -> Self {
        Self {
            api: RateLimiter::new(60, 1.0),
            ws: RateLimiter::new(5, 12.0),
            admin: RateLimiter::new(10, 6.0),
            webhook: RateLimiter::new(50, 0.2),
        }
    }
}

impl ApiRateLimiters {
    /// Drop per-IP buckets idle for longer than `idle`, across all tiers.
    pub fn cleanup(&self, idle: Duration) -> usize {
        self.api.cleanup(idle)
            + self.ws.cleanup(idle)
            + self.admin.cleanup(idle)
            + self.webhook.cleanup(idle)
    }

    pub fn len(&self) -> usize {
        self.api.len() + self.ws.len() + self.admin.len() + self.webhook.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sweep idle per-IP buckets every `period` until `cancel` fires.
pub fn spawn_limiter_sweep(
    limiters: Arc<ApiRateLimiters>,
    period: Duration,
    idle: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn_sweep("http-limiters", period, cancel, move || {
        let removed = limiters.cleanup(idle);
        if removed > 0 {
            debug!(removed, remaining = limiters.len(), "idle rate-limit buckets removed");
        }
    })
}

/// Client IP for a request, trusting proxy headers only from loopback.
///
/// When the direct peer is a loopback address the connection is coming
/// through a local reverse proxy and X-Forwarded-For / X-Real-IP are used.
/// Otherwise the peer address wins so headers cannot be spoofed.
pub fn client_ip(peer: Option<SocketAddr>, headers: &HeaderMap) -> String {
    let peer_ip = peer.map(|p| p.ip());
    let from_loopback = peer_ip.is_some_and(|ip| ip.is_loopback());

    if from_loopback {
        if let Some(forwarded) = headers.get("x-forwarded-for")
            && let Ok(val) = forwarded.to_str()
            && let Some(first) = val.split(',').next()
            && !first.trim().is_empty()
        {
            return first.trim().to_string();
        }

        if let Some(real_ip) = headers.get("x-real-ip")
            && let Ok(val) = real_ip.to_str()
        {
            return val.trim().to_string();
        }
    }

    peer_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn request_ip(req: &Request<Body>) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    client_ip(peer, req.headers())
}

async fn limited(
    req: Request<Body>,
    next: Next,
    pick: fn(&ApiRateLimiters) -> &RateLimiter,
    message: &'static str,
) -> Response {
    if let Some(limiters) = req.extensions().get::<Arc<ApiRateLimiters>>() {
        let ip = request_ip(&req);
        if !pick(limiters).check(&ip) {
            return (StatusCode::TOO_MANY_REQUESTS, message).into_response();
        }
    }
    next.run(req).await
}

/// Middleware for general API rate limiting.
pub async fn api_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(
        req,
        next,
        |l| &l.api,
        "Rate limit exceeded. Please try again later.",
    )
    .await
}

/// Middleware for WebSocket connection rate limiting.
pub async fn ws_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(
        req,
        next,
        |l| &l.ws,
        "Too many connections. Please try again later.",
    )
    .await
}

pub async fn admin_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(
        req,
        next,
        |l| &l.admin,
        "Rate limit exceeded. Please try again later.",
    )
    .await
}

pub async fn webhook_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(
        req,
        next,
        |l| &l.webhook,
        "Rate limit exceeded. Please try again later.",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_proxy_headers_trusted_from_loopback() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(client_ip(Some(peer), &h), "203.0.113.7");

        let h = headers(&[("x-real-ip", "203.0.113.8")]);
        assert_eq!(client_ip(Some(peer), &h), "203.0.113.8");
    }

    #[test]
    fn test_proxy_headers_ignored_from_remote_peer() {
        let peer: SocketAddr = "198.51.100.2:5000".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "203.0.113.7")]);
        assert_eq!(client_ip(Some(peer), &h), "198.51.100.2");
    }

    #[test]
    fn test_unknown_without_peer() {
        assert_eq!(client_ip(None, &HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_cleanup_sweeps_every_tier() {
        let limiters = ApiRateLimiters::default();
        limiters.api.check("203.0.113.1");
        limiters.ws.check("203.0.113.2");
        limiters.admin.check("203.0.113.3");
        limiters.webhook.check("203.0.113.4");
        assert_eq!(limiters.len(), 4);

        assert_eq!(limiters.cleanup(LIMITER_IDLE), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(limiters.cleanup(Duration::from_millis(1)), 4);
        assert!(limiters.is_empty());
    }

    #[tokio::test]
    async fn test_limiter_sweep_runs_until_cancelled() {
        let limiters = Arc::new(ApiRateLimiters::default());
        limiters.api.check("203.0.113.9");
        std::thread::sleep(Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let handle = spawn_limiter_sweep(
            limiters.clone(),
            Duration::from_millis(10),
            Duration::from_millis(1),
            cancel.clone(),
        );
        tokio::time::timeout(Duration::from_secs(2), async {
            while !limiters.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }
}
