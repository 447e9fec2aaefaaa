//! Per-IP token bucket rate limiter for the HTTP API.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ApiError;

/// Buckets idle this long are full again and can be forgotten.
const IDLE_EVICTION: Duration = Duration::from_secs(120);
const EVICTION_THRESHOLD: usize = 10_000;
/// Idle buckets are also swept once every this many checks.
const SWEEP_EVERY: u64 = 256;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    checks: Arc<AtomicU64>,
    max_tokens: u32,
    refill_per_sec: f64,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Allow `per_minute` requests per IP, refilled continuously.
    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            checks: Arc::new(AtomicU64::new(0)),
            max_tokens: per_minute,
            refill_per_sec: f64::from(per_minute) / 60.0,
        }
    }

    /// Try to take one token for `ip`.
    pub async fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().await;

        let sweep_due = self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0;
        if sweep_due || buckets.len() > EVICTION_THRESHOLD {
            buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < IDLE_EVICTION);
        }

        let bucket = buckets.entry(ip).or_insert(TokenBucket {
            tokens: f64::from(self.max_tokens),
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.refill_per_sec).min(f64::from(self.max_tokens));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Requests without peer address info (e.g. in-process calls) are not limited.
pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(ip) = peer {
        if !limiter.check(ip).await {
            warn!("Rate limit exceeded for {}", ip);
            return Err(ApiError::RateLimited);
        }
    }

    Ok(next.run(req).await)
}
