//! Fraud Service
//!
//! Multi-tenant transaction risk scoring:
//! - Rule evaluation against tenant-defined fraud patterns
//! - AI risk analysis with a rule-weighted fallback
//! - Weighted aggregation and automatic case escalation
//! - Fraud case management, statistics, per-tenant scoring policy

pub mod ai_client;
pub mod auth;
pub mod cases;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod routes;
pub mod stats;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::FromRef;

pub use config::FraudConfig;
pub use error::{Error, Result};
pub use routes::create_router;

use ai_client::TextGenerator;
use auth::TokenVerifier;
use cases::CaseManager;
use engine::{AiRiskAnalyst, FraudDetectionService, UserLocks};
use metrics::FraudMetrics;
use rate_limit::{RateLimitStore, RateLimiter};
use store::FraudStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FraudStore>,
    pub detector: FraudDetectionService,
    pub cases: CaseManager,
    pub auth: TokenVerifier,
    pub rate_limiter: RateLimiter,
    pub metrics: FraudMetrics,
    pub config: Arc<FraudConfig>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the service from its injected backends
    pub fn new(
        config: FraudConfig,
        store: Arc<dyn FraudStore>,
        generator: Arc<dyn TextGenerator>,
        rate_store: Arc<dyn RateLimitStore>,
    ) -> Self {
        let metrics = FraudMetrics::new();
        let cases = CaseManager::new(store.clone(), config.enforce_case_transitions);
        let analyst = AiRiskAnalyst::new(generator).with_timeout(config.ai.timeout);

        let mut detector = FraudDetectionService::new(store.clone(), analyst, metrics.clone());
        if config.serialize_user_scoring {
            detector = detector.with_user_locks(UserLocks::new());
        }

        let rate_limiter = RateLimiter::new(
            rate_store,
            config.rate_limit.requests_per_window,
            config.rate_limit.window,
        );

        Self {
            store,
            detector,
            cases,
            auth: TokenVerifier::new(&config.jwt_secret),
            rate_limiter,
            metrics,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

impl FromRef<AppState> for TokenVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
