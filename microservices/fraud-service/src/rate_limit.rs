//! Per-tenant rate limiting
//!
//! Fixed-window counters behind an injectable store: process-local buckets
//! for a single instance, a shared Postgres table when several instances
//! serve the same tenants.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use opsdesk_db::DbPool;
use tracing::{debug, error};

use crate::{AppState, Error, Result};

/// Counter state after one hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u64,
    pub reset_after_secs: u64,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request against `key`, opening a new window when the
    /// current one is older than `window`
    async fn hit(&self, key: &str, window: Duration) -> Result<RateWindow>;
}

struct RateBucket {
    count: u64,
    window_start: Instant,
}

/// Expired buckets are swept once every this many hits
const PRUNE_EVERY: u64 = 1024;

#[derive(Clone, Default)]
pub struct MemoryRateLimitStore {
    buckets: Arc<DashMap<String, RateBucket>>,
    hits: Arc<AtomicU64>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop buckets whose window has closed
    fn prune(&self, window: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.window_start) < window);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<RateWindow> {
        if (self.hits.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            self.prune(window);
        }

        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert(RateBucket {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        let elapsed = now.duration_since(entry.window_start);
        Ok(RateWindow {
            count: entry.count,
            reset_after_secs: window.saturating_sub(elapsed).as_secs(),
        })
    }
}

/// Buckets shared by every instance through `rate_limit_buckets`
#[derive(Clone)]
pub struct PgRateLimitStore {
    db: DbPool,
}

impl PgRateLimitStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

const HIT_SQL: &str = "\
    INSERT INTO rate_limit_buckets (key, window_start, count) VALUES ($1, now(), 1) \
    ON CONFLICT (key) DO UPDATE SET \
        window_start = CASE WHEN rate_limit_buckets.window_start + make_interval(secs => $2::float8) <= now() \
            THEN now() ELSE rate_limit_buckets.window_start END, \
        count = CASE WHEN rate_limit_buckets.window_start + make_interval(secs => $2::float8) <= now() \
            THEN 1 ELSE rate_limit_buckets.count + 1 END \
    RETURNING count, \
        GREATEST(0, CEIL(EXTRACT(EPOCH FROM \
            (window_start + make_interval(secs => $2::float8) - now()))))::BIGINT AS reset_after";

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<RateWindow> {
        let client = self.db.get().await?;
        let window_secs = window.as_secs_f64();
        let row = client.query_one(HIT_SQL, &[&key, &window_secs]).await?;
        let count: i64 = row.try_get("count")?;
        let reset_after: i64 = row.try_get("reset_after")?;
        Ok(RateWindow {
            count: count.max(0) as u64,
            reset_after_secs: reset_after.max(0) as u64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    Exceeded { retry_after_secs: u64 },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, limit: u64, window: Duration) -> Self {
        Self { store, limit, window }
    }

    pub async fn check(&self, key: &str) -> Result<RateDecision> {
        let state = self.store.hit(key, self.window).await?;
        if state.count > self.limit {
            Ok(RateDecision::Exceeded {
                retry_after_secs: state.reset_after_secs.max(1),
            })
        } else {
            Ok(RateDecision::Allowed {
                remaining: self.limit - state.count,
            })
        }
    }

    pub async fn check_tenant(&self, tenant_key: &str) -> Result<RateDecision> {
        self.check(&format!("tenant:{}", tenant_key)).await
    }
}

/// Axum middleware for the `/api` routes. Verifies the bearer token once and
/// hands the result to the `AuthContext` extractor through request extensions.
pub async fn enforce(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let key = match state.auth.authenticate(req.headers()) {
        Ok(ctx) => {
            let key = ctx.tenant_id.to_string();
            req.extensions_mut().insert(ctx);
            key
        }
        Err(_) => "anonymous".to_string(),
    };

    let remaining = match state.rate_limiter.check_tenant(&key).await {
        Ok(RateDecision::Allowed { remaining }) => Some(remaining),
        Ok(RateDecision::Exceeded { retry_after_secs }) => {
            state.metrics.rate_limited.inc();
            debug!(key = %key, retry_after_secs, "Rate limit exceeded");
            return Error::RateLimited { retry_after_secs }.into_response();
        }
        Err(e) => {
            // Fail open
            error!(error = %e, "Rate limit store unavailable");
            None
        }
    };

    let mut response = next.run(req).await;
    if let Some(remaining) = remaining {
        response
            .headers_mut()
            .insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    }
    response
}
