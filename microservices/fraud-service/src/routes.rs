//! Router configuration for Fraud Service API

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::rate_limit;
use crate::AppState;

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Scoring
        .route("/api/v1/fraud/analyze", post(handlers::analyze_transaction))
        .route("/api/v1/fraud/transactions", get(handlers::list_transactions))
        .route("/api/v1/fraud/transactions/{id}", get(handlers::get_transaction))
        // Cases
        .route(
            "/api/v1/fraud/cases",
            get(handlers::list_cases).post(handlers::create_case),
        )
        .route(
            "/api/v1/fraud/cases/{id}",
            get(handlers::get_case).patch(handlers::update_case),
        )
        // Patterns
        .route(
            "/api/v1/fraud/patterns",
            get(handlers::list_patterns).post(handlers::create_pattern),
        )
        .route(
            "/api/v1/fraud/patterns/{id}",
            get(handlers::get_pattern)
                .patch(handlers::update_pattern)
                .delete(handlers::delete_pattern),
        )
        // Statistics & policy
        .route("/api/v1/fraud/statistics", get(handlers::statistics))
        .route(
            "/api/v1/fraud/policy",
            get(handlers::get_policy).put(handlers::put_policy),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit::enforce));

    Router::new()
        // Health & Metrics
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/stats", get(handlers::stats))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
