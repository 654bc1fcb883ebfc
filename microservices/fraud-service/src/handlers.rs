//! HTTP handlers for Fraud Service API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use opsdesk_core::{DependencyStatus, ReadinessStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::auth::{AuthContext, Role};
use crate::domain::{
    AnalyzeTransactionRequest, CreateCaseRequest, CreatePatternRequest, FraudCase, FraudPattern,
    ScoredTransaction, ScoringPolicy, UpdateCaseRequest, UpdatePatternRequest,
};
use crate::engine::FraudAnalysisResult;
use crate::metrics::MetricsSnapshot;
use crate::stats::{self, FraudStatistics};
use crate::{AppState, Error, Result};

type JsonBody<T> = std::result::Result<Json<T>, JsonRejection>;

/// Malformed bodies are reported like any other invalid request
fn body<T>(payload: JsonBody<T>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::InvalidRequest(rejection.body_text()))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub store: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub scoring: MetricsSnapshot,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatisticsQuery {
    pub days: Option<i64>,
}

// ============================================
// Health & Metrics Handlers
// ============================================

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.service.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.store.backend_name().to_string(),
    })
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessStatus>) {
    let started = std::time::Instant::now();
    let store_ok = state.store.is_healthy().await;
    let status = ReadinessStatus {
        ready: store_ok,
        dependencies: vec![DependencyStatus {
            name: state.store.backend_name().to_string(),
            available: store_ok,
            latency_ms: Some(started.elapsed().as_millis() as u64),
        }],
    };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        scoring: state.metrics.snapshot(),
    })
}

// ============================================
// Scoring Handlers
// ============================================

pub async fn analyze_transaction(
    State(state): State<AppState>,
    auth: AuthContext,
    payload: JsonBody<AnalyzeTransactionRequest>,
) -> Result<Json<FraudAnalysisResult>> {
    auth.require(Role::Analyst)?;
    let req = body(payload)?;
    let result = state
        .detector
        .analyze(&auth.request_context(), auth.tenant_id, req)
        .await?;
    Ok(Json(result))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ScoredTransaction>>> {
    auth.require(Role::Viewer)?;
    let limit = state.config.list_limit(query.limit);
    let transactions = state
        .store
        .recent_transactions(auth.tenant_id, query.user_id.as_deref(), limit)
        .await?;
    Ok(Json(transactions))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ScoredTransaction>> {
    auth.require(Role::Viewer)?;
    let txn = state
        .store
        .get_transaction(auth.tenant_id, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Transaction {}", id)))?;
    Ok(Json(txn))
}

// ============================================
// Case Handlers
// ============================================

pub async fn list_cases(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<FraudCase>>> {
    auth.require(Role::Viewer)?;
    let limit = state.config.list_limit(query.limit);
    Ok(Json(state.cases.list(auth.tenant_id, limit).await?))
}

pub async fn create_case(
    State(state): State<AppState>,
    auth: AuthContext,
    payload: JsonBody<CreateCaseRequest>,
) -> Result<(StatusCode, Json<FraudCase>)> {
    auth.require(Role::Analyst)?;
    let req = body(payload)?;
    let case = state
        .cases
        .create(auth.tenant_id, Some(auth.user_id.as_str()), req)
        .await?;
    Ok((StatusCode::CREATED, Json(case)))
}

pub async fn get_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<FraudCase>> {
    auth.require(Role::Viewer)?;
    Ok(Json(state.cases.get(auth.tenant_id, id).await?))
}

pub async fn update_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    payload: JsonBody<UpdateCaseRequest>,
) -> Result<Json<FraudCase>> {
    auth.require(Role::Analyst)?;
    let req = body(payload)?;
    Ok(Json(state.cases.update(auth.tenant_id, id, req).await?))
}

// ============================================
// Pattern Handlers
// ============================================

pub async fn list_patterns(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<PatternQuery>,
) -> Result<Json<Vec<FraudPattern>>> {
    auth.require(Role::Viewer)?;
    let patterns = state
        .store
        .list_patterns(auth.tenant_id, query.active_only)
        .await?;
    Ok(Json(patterns))
}

pub async fn create_pattern(
    State(state): State<AppState>,
    auth: AuthContext,
    payload: JsonBody<CreatePatternRequest>,
) -> Result<(StatusCode, Json<FraudPattern>)> {
    auth.require(Role::Admin)?;
    let req = body(payload)?;
    req.validate()?;

    let pattern = FraudPattern::from_request(auth.tenant_id, req);
    state.store.insert_pattern(&pattern).await?;

    tracing::info!(
        tenant_id = %auth.tenant_id,
        pattern_id = %pattern.id,
        pattern_type = pattern.pattern_type.as_str(),
        "Fraud pattern created"
    );
    Ok((StatusCode::CREATED, Json(pattern)))
}

pub async fn get_pattern(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<FraudPattern>> {
    auth.require(Role::Viewer)?;
    let pattern = state
        .store
        .get_pattern(auth.tenant_id, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Pattern {}", id)))?;
    Ok(Json(pattern))
}

pub async fn update_pattern(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    payload: JsonBody<UpdatePatternRequest>,
) -> Result<Json<FraudPattern>> {
    auth.require(Role::Admin)?;
    let req = body(payload)?;
    req.validate()?;

    let pattern = state
        .store
        .update_pattern(auth.tenant_id, id, req)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Pattern {}", id)))?;
    Ok(Json(pattern))
}

pub async fn delete_pattern(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    auth.require(Role::Admin)?;
    if state.store.delete_pattern(auth.tenant_id, id).await? {
        tracing::info!(tenant_id = %auth.tenant_id, pattern_id = %id, "Fraud pattern deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("Pattern {}", id)))
    }
}

// ============================================
// Statistics & Policy Handlers
// ============================================

pub async fn statistics(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<FraudStatistics>> {
    auth.require(Role::Viewer)?;
    let days = stats::window_days(query.days)?;
    Ok(Json(stats::compute(state.store.as_ref(), auth.tenant_id, days).await?))
}

pub async fn get_policy(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ScoringPolicy>> {
    auth.require(Role::Viewer)?;
    let policy = state.store.get_policy(auth.tenant_id).await?.unwrap_or_default();
    Ok(Json(policy))
}

pub async fn put_policy(
    State(state): State<AppState>,
    auth: AuthContext,
    payload: JsonBody<ScoringPolicy>,
) -> Result<Json<ScoringPolicy>> {
    auth.require(Role::Admin)?;
    let policy = body(payload)?;
    policy.validate().map_err(Error::InvalidRequest)?;
    state.store.put_policy(auth.tenant_id, policy).await?;

    tracing::info!(
        tenant_id = %auth.tenant_id,
        escalation_threshold = policy.escalation_threshold,
        ai_weight = policy.ai_weight,
        "Scoring policy updated"
    );
    Ok(Json(policy))
}
