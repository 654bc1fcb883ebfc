//! End-to-end API tests against the in-memory store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use opsdesk_core::TenantId;
use serde_json::{json, Value};
use tower::ServiceExt;

use fraud_service::ai_client::{AiError, DisabledGenerator, TextGenerator};
use fraud_service::auth::{Claims, Role, TokenVerifier};
use fraud_service::config::RateLimitConfig;
use fraud_service::rate_limit::MemoryRateLimitStore;
use fraud_service::store::MemoryStore;
use fraud_service::{create_router, AppState, FraudConfig};

const SECRET: &str = "integration-secret";

struct Scripted(String);

#[async_trait]
impl TextGenerator for Scripted {
    async fn generate(&self, _prompt: &str, _schema_hint: &str) -> Result<String, AiError> {
        Ok(self.0.clone())
    }
}

fn app_with(config: FraudConfig, generator: Arc<dyn TextGenerator>) -> Router {
    let state = AppState::new(
        config,
        Arc::new(MemoryStore::new()),
        generator,
        Arc::new(MemoryRateLimitStore::new()),
    );
    create_router(state)
}

fn app(generator: Arc<dyn TextGenerator>) -> Router {
    app_with(FraudConfig::in_memory(SECRET), generator)
}

fn token(tenant: TenantId, roles: &[Role]) -> String {
    TokenVerifier::new(SECRET)
        .issue(&Claims::new("user-1", tenant, roles, 3600))
        .unwrap()
}

async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn transaction(id: &str) -> Value {
    json!({
        "transactionId": id,
        "amount": 125_000,
        "currency": "USD",
        "userId": "customer-9",
        "location": {"country": "KP"}
    })
}

#[tokio::test]
async fn test_health_is_public() {
    let app = app(Arc::new(DisabledGenerator));
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "memory");

    let (status, body) = send(&app, Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = app(Arc::new(DisabledGenerator));
    let (status, body) = send(&app, Method::GET, "/api/v1/fraud/cases", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn test_viewer_cannot_analyze() {
    let app = app(Arc::new(DisabledGenerator));
    let viewer = token(TenantId::generate(), &[Role::Viewer]);
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/analyze",
        Some(&viewer),
        Some(transaction("tx-1")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_analyze_with_ai_unavailable() {
    let app = app(Arc::new(DisabledGenerator));
    let analyst = token(TenantId::generate(), &[Role::Analyst]);
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/analyze",
        Some(&analyst),
        Some(transaction("tx-1")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["riskScore"], 35);
    assert_eq!(body["confidenceLevel"], 50);
    assert_eq!(body["detectionMethod"], "ai_pattern");
    assert_eq!(body["flags"], json!(["ai_technical_error"]));
    assert_eq!(body["aiAnalysis"]["recommendations"], json!(["Manual review recommended"]));
    assert_eq!(body["caseId"], Value::Null);

    let id = body["transactionId"].as_str().unwrap();
    let (status, stored) = send(
        &app,
        Method::GET,
        &format!("/api/v1/fraud/transactions/{}", id),
        Some(&analyst),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["transactionRef"], "tx-1");
    assert_eq!(stored["flagged"], false);
}

#[tokio::test]
async fn test_invalid_transaction_rejected() {
    let app = app(Arc::new(DisabledGenerator));
    let analyst = token(TenantId::generate(), &[Role::Analyst]);
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/analyze",
        Some(&analyst),
        Some(json!({"transactionId": "tx-1", "amount": -10, "currency": "USD"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/analyze",
        Some(&analyst),
        Some(json!({"amount": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_high_risk_escalates_to_case() {
    let generator = Arc::new(Scripted(
        json!({
            "confidence": 88,
            "flags": ["high_risk_region"],
            "summary": "Likely fraud",
            "reasoning": "Restricted destination",
            "recommendations": ["Hold funds"],
            "patterns": ["geographic"]
        })
        .to_string(),
    ));
    let app = app(generator);
    let tenant = TenantId::generate();
    let admin = token(tenant, &[Role::Admin]);

    let (status, pattern) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/patterns",
        Some(&admin),
        Some(json!({
            "name": "Restricted countries",
            "patternType": "geographic",
            "detectionRules": {"restrictedCountries": ["KP", "IR"]},
            "thresholds": {"restrictedCountryScore": 90}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, result) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/analyze",
        Some(&admin),
        Some(transaction("tx-risky")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // round(88 * 0.7 + 90 * 0.3) = 89
    assert_eq!(result["riskScore"], 89);
    assert_eq!(result["detectionMethod"], "hybrid");
    assert_eq!(result["flagged"], true);
    assert_eq!(result["patternMatches"][0]["patternName"], "Restricted countries");
    assert_eq!(result["patternMatches"][0]["confidence"], 90);

    let case_id = result["caseId"].as_str().unwrap();
    let (status, case) = send(
        &app,
        Method::GET,
        &format!("/api/v1/fraud/cases/{}", case_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(case["status"], "pending");
    assert_eq!(case["detectionMethod"], "hybrid");
    assert_eq!(case["aiAnalysis"]["summary"], "Likely fraud");

    let pattern_id = pattern["id"].as_str().unwrap();
    let (_, stored_pattern) = send(
        &app,
        Method::GET,
        &format!("/api/v1/fraud/patterns/{}", pattern_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(stored_pattern["matchCount"], 1);

    let (status, stats) = send(&app, Method::GET, "/api/v1/fraud/statistics?days=7", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalTransactions"], 1);
    assert_eq!(stats["flaggedTransactions"], 1);
    assert_eq!(stats["flaggedPercentage"], 100);
    assert_eq!(stats["avgRiskScore"], 89);
    assert_eq!(stats["topPatterns"][0]["name"], "Restricted countries");

    let (_, again) = send(&app, Method::GET, "/api/v1/fraud/statistics?days=7", Some(&admin), None).await;
    assert_eq!(again, stats);
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let app = app(Arc::new(DisabledGenerator));
    let owner = token(TenantId::generate(), &[Role::Admin]);
    let outsider = token(TenantId::generate(), &[Role::Admin]);

    let (status, case) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/cases",
        Some(&owner),
        Some(json!({
            "transactionId": "tx-7",
            "amount": 900,
            "currency": "EUR",
            "riskScore": 55
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let uri = format!("/api/v1/fraud/cases/{}", case["id"].as_str().unwrap());

    let (status, fetched) = send(&app, Method::GET, &uri, Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, case);

    let (status, _) = send(&app, Method::GET, &uri, Some(&outsider), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::PATCH,
        &uri,
        Some(&outsider),
        Some(json!({"status": "resolved"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listed) = send(&app, Method::GET, "/api/v1/fraud/cases", Some(&outsider), None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_case_lifecycle() {
    let app = app(Arc::new(DisabledGenerator));
    let analyst = token(TenantId::generate(), &[Role::Analyst]);

    let (_, case) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/cases",
        Some(&analyst),
        Some(json!({
            "transactionId": "tx-8",
            "amount": 100,
            "currency": "GBP",
            "riskScore": 20,
            "notes": "flagged by support"
        })),
    )
    .await;
    assert_eq!(case["detectionMethod"], "manual");
    let uri = format!("/api/v1/fraud/cases/{}", case["id"].as_str().unwrap());

    let (status, updated) = send(
        &app,
        Method::PATCH,
        &uri,
        Some(&analyst),
        Some(json!({"status": "false_positive", "assignedTo": "reviewer-2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "false_positive");
    assert_eq!(updated["assignedTo"], "reviewer-2");
    assert_eq!(updated["notes"], "flagged by support");
    assert!(updated["resolvedAt"].is_string());

    let (status, _) = send(
        &app,
        Method::PATCH,
        &uri,
        Some(&analyst),
        Some(json!({"status": "closed"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_empty_statistics() {
    let app = app(Arc::new(DisabledGenerator));
    let viewer = token(TenantId::generate(), &[Role::Viewer]);
    let (status, stats) = send(&app, Method::GET, "/api/v1/fraud/statistics", Some(&viewer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        stats,
        json!({
            "totalTransactions": 0,
            "flaggedTransactions": 0,
            "flaggedPercentage": 0,
            "avgRiskScore": 0,
            "topPatterns": []
        })
    );

    let (status, _) = send(&app, Method::GET, "/api/v1/fraud/statistics?days=0", Some(&viewer), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pattern_admin_only_and_delete() {
    let app = app(Arc::new(DisabledGenerator));
    let tenant = TenantId::generate();
    let admin = token(tenant, &[Role::Admin]);
    let analyst = token(tenant, &[Role::Analyst]);
    let body = json!({"name": "Burst", "patternType": "velocity"});

    let (status, _) = send(&app, Method::POST, "/api/v1/fraud/patterns", Some(&analyst), Some(body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/patterns",
        Some(&admin),
        Some(json!({"name": "Odd", "patternType": "keystroke"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, pattern) = send(&app, Method::POST, "/api/v1/fraud/patterns", Some(&admin), Some(body)).await;
    assert_eq!(pattern["isActive"], true);
    assert_eq!(pattern["thresholds"], json!({}));
    let uri = format!("/api/v1/fraud/patterns/{}", pattern["id"].as_str().unwrap());

    let (status, updated) = send(&app, Method::PATCH, &uri, Some(&admin), Some(json!({"isActive": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["isActive"], false);

    let (_, active) = send(&app, Method::GET, "/api/v1/fraud/patterns?activeOnly=true", Some(&analyst), None).await;
    assert_eq!(active, json!([]));

    let (status, _) = send(&app, Method::DELETE, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_policy_changes_escalation() {
    let app = app(Arc::new(Scripted(r#"{"confidence": 60}"#.to_string())));
    let tenant = TenantId::generate();
    let admin = token(tenant, &[Role::Admin]);

    let (_, policy) = send(&app, Method::GET, "/api/v1/fraud/policy", Some(&admin), None).await;
    assert_eq!(policy, json!({"escalationThreshold": 70, "aiWeight": 0.7, "ruleWeight": 0.3}));

    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/v1/fraud/policy",
        Some(&admin),
        Some(json!({"escalationThreshold": 50, "aiWeight": 0.7, "ruleWeight": 0.5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/v1/fraud/policy",
        Some(&admin),
        Some(json!({"escalationThreshold": 50, "aiWeight": 1.0, "ruleWeight": 0.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, result) = send(
        &app,
        Method::POST,
        "/api/v1/fraud/analyze",
        Some(&admin),
        Some(transaction("tx-policy")),
    )
    .await;
    assert_eq!(result["riskScore"], 60);
    assert_eq!(result["flagged"], true);
    assert!(result["caseId"].is_string());
}

#[tokio::test]
async fn test_rate_limit_per_tenant() {
    let mut config = FraudConfig::in_memory(SECRET);
    config.rate_limit = RateLimitConfig {
        requests_per_window: 2,
        window: Duration::from_secs(60),
        ..RateLimitConfig::default()
    };
    let app = app_with(config, Arc::new(DisabledGenerator));
    let busy = token(TenantId::generate(), &[Role::Viewer]);
    let quiet = token(TenantId::generate(), &[Role::Viewer]);

    for _ in 0..2 {
        let (status, _) = send(&app, Method::GET, "/api/v1/fraud/cases", Some(&busy), None).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = send(&app, Method::GET, "/api/v1/fraud/cases", Some(&busy), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], 429);

    let (status, _) = send(&app, Method::GET, "/api/v1/fraud/cases", Some(&quiet), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, stats) = send(&app, Method::GET, "/stats", None, None).await;
    assert_eq!(stats["rateLimited"], 1);
}
