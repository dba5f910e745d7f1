//! Per-IP token bucket for the login and refresh routes
//!
//! Each visitor holds up to `burst` tokens, refilled at `per_sec`. A janitor
//! task drops visitors that have been idle longer than `idle`.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::gateway::ApiError;

#[derive(Debug, Clone, Copy)]
struct Visitor {
    tokens: f64,
    refilled_at: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    per_sec: f64,
    burst: f64,
    idle: Duration,
    sweep_every: Duration,
    visitors: DashMap<String, Visitor>,
}

impl RateLimiter {
    pub fn new(per_sec: f64, burst: u32, idle: Duration, sweep_every: Duration) -> Self {
        Self {
            per_sec,
            burst: burst.max(1) as f64,
            idle,
            sweep_every,
            visitors: DashMap::new(),
        }
    }

    /// Take one token for `key`; `false` when the bucket is empty
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut visitor = self.visitors.entry(key.to_string()).or_insert(Visitor {
            tokens: self.burst,
            refilled_at: now,
            last_seen: now,
        });
        let elapsed = now.saturating_duration_since(visitor.refilled_at).as_secs_f64();
        visitor.tokens = (visitor.tokens + elapsed * self.per_sec).min(self.burst);
        visitor.refilled_at = now;
        visitor.last_seen = now;
        if visitor.tokens >= 1.0 {
            visitor.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop idle visitors; returns how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.visitors.len();
        self.visitors
            .retain(|_, v| now.saturating_duration_since(v.last_seen) < self.idle);
        before - self.visitors.len()
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    pub async fn run_janitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(sweep_secs = self.sweep_every.as_secs(), "Starting visitor janitor");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sweep_every) => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = self.visitor_count(), "Pruned idle visitors");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Visitor janitor stopped");
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded
        .or(real)
        .map(String::from)
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let ip = client_ip(request.headers(), peer);
    if !limiter.allow(&ip) {
        warn!(ip = %ip, path = %request.uri().path(), "Rate limit exceeded");
        return ApiError::too_many_requests("Too many requests").into_err();
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn limiter() -> RateLimiter {
        RateLimiter::new(1.0, 3, Duration::from_secs(180), Duration::from_secs(60))
    }

    #[test]
    fn test_burst_then_refill() {
        let rl = limiter();
        let t0 = Instant::now();
        assert!(rl.allow_at("1.2.3.4", t0));
        assert!(rl.allow_at("1.2.3.4", t0));
        assert!(rl.allow_at("1.2.3.4", t0));
        assert!(!rl.allow_at("1.2.3.4", t0));
        // other visitors have their own bucket
        assert!(rl.allow_at("5.6.7.8", t0));
        // one token per second
        assert!(rl.allow_at("1.2.3.4", t0 + Duration::from_secs(1)));
        assert!(!rl.allow_at("1.2.3.4", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_sweep_drops_idle_visitors() {
        let rl = limiter();
        let t0 = Instant::now();
        rl.allow_at("a", t0);
        rl.allow_at("b", t0 + Duration::from_secs(120));
        assert_eq!(rl.sweep_at(t0 + Duration::from_secs(200)), 1);
        assert_eq!(rl.visitor_count(), 1);
    }

    #[test]
    fn test_client_ip_sources() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "10.0.0.9");
        assert_eq!(client_ip(&headers, None), "unknown");
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, Some(peer)), "9.9.9.9");
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1, 2.2.2.2"));
        assert_eq!(client_ip(&headers, Some(peer)), "1.1.1.1");
    }

    #[tokio::test]
    async fn test_janitor_stops_on_shutdown() {
        let rl = Arc::new(limiter());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(rl.clone().run_janitor(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
