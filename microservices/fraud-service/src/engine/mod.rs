//! Fraud detection pipeline
//!
//! Rule evaluation per active pattern, AI analysis, weighted aggregation,
//! ledger write, and escalation to a case when the score crosses the
//! tenant's threshold. Steps run sequentially inside one request.

pub mod aggregator;
pub mod analyst;
pub mod locks;
pub mod rules;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use opsdesk_core::{RequestContext, TenantId};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cases::{CaseManager, Escalation};
use crate::domain::{
    AiAnalysis, AnalyzeTransactionRequest, DetectionMethod, PatternMatch, ScoredTransaction,
};
use crate::metrics::FraudMetrics;
use crate::store::FraudStore;
use crate::Result;

pub use aggregator::{aggregate, RiskAggregate};
pub use analyst::{AiAssessment, AiRiskAnalyst, AnalysisError, ParsedAnalysis};
pub use locks::UserLocks;
pub use rules::{RuleEvaluator, RuleOutcome};

/// Response of the analyze operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudAnalysisResult {
    /// Ledger id of the stored transaction
    pub transaction_id: Uuid,
    pub transaction_ref: String,
    pub risk_score: u8,
    pub confidence_level: u8,
    pub detection_method: DetectionMethod,
    pub flags: Vec<String>,
    pub ai_analysis: AiAnalysis,
    pub pattern_matches: Vec<PatternMatch>,
    pub flagged: bool,
    pub case_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct FraudDetectionService {
    store: Arc<dyn FraudStore>,
    analyst: AiRiskAnalyst,
    metrics: FraudMetrics,
    user_locks: Option<UserLocks>,
}

impl FraudDetectionService {
    pub fn new(
        store: Arc<dyn FraudStore>,
        analyst: AiRiskAnalyst,
        metrics: FraudMetrics,
    ) -> Self {
        Self {
            store,
            analyst,
            metrics,
            user_locks: None,
        }
    }

    /// Serialize scoring per (tenant, user) within this process
    pub fn with_user_locks(mut self, locks: UserLocks) -> Self {
        self.user_locks = Some(locks);
        self
    }

    pub async fn analyze(
        &self,
        ctx: &RequestContext,
        tenant: TenantId,
        req: AnalyzeTransactionRequest,
    ) -> Result<FraudAnalysisResult> {
        req.validate()?;

        self.metrics.in_flight.inc();
        let started = Instant::now();
        let result = self.analyze_locked(ctx, tenant, &req).await;
        self.metrics.in_flight.dec();
        self.metrics
            .scoring_latency_ms
            .record(started.elapsed().as_secs_f64() * 1000.0);

        result
    }

    async fn analyze_locked(
        &self,
        ctx: &RequestContext,
        tenant: TenantId,
        req: &AnalyzeTransactionRequest,
    ) -> Result<FraudAnalysisResult> {
        // Held from the first history read until the ledger write
        let _user_guard = match (&self.user_locks, req.user_id.as_deref()) {
            (Some(locks), Some(user_id)) => Some(locks.acquire(tenant, user_id).await),
            _ => None,
        };

        let policy = self.store.get_policy(tenant).await?.unwrap_or_default();
        let patterns = self.store.list_patterns(tenant, true).await?;
        let now = Utc::now();

        let evaluator = RuleEvaluator::new(self.store.as_ref());
        let mut pattern_matches = Vec::new();
        let mut rule_scores = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            let outcome = evaluator.evaluate(tenant, req, pattern, now).await;
            rule_scores.push(outcome.score);
            if !outcome.matched() {
                continue;
            }

            debug!(
                request_id = %ctx.request_id,
                pattern = %pattern.name,
                score = outcome.score,
                "Pattern matched"
            );
            if let Err(e) = self.store.record_pattern_match(tenant, pattern.id, now).await {
                warn!(pattern_id = %pattern.id, error = %e, "Failed to record pattern match");
            }
            self.metrics.pattern_matches.inc();
            pattern_matches.push(PatternMatch {
                pattern_id: pattern.id,
                pattern_name: pattern.name.clone(),
                pattern_type: pattern.pattern_type,
                confidence: outcome.score,
                details: outcome.details,
            });
        }

        let history = self
            .store
            .recent_transactions(tenant, req.user_id.as_deref(), analyst::HISTORY_LIMIT)
            .await?;
        let assessment = self.analyst.assess(req, &history, &patterns).await;
        if !assessment.ai_processed {
            self.metrics.ai_fallbacks.inc();
        }

        let aggregate = aggregate(&policy, assessment.confidence, &rule_scores);
        let flags = merge_flags(&assessment.flags, &pattern_matches);

        let transaction = ScoredTransaction {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            transaction_ref: req.transaction_id.clone(),
            amount: req.amount,
            currency: req.currency.to_ascii_uppercase(),
            transaction_type: req.transaction_type.clone(),
            user_id: req.user_id.clone(),
            merchant: req.merchant.clone(),
            device: req.device.clone(),
            location: req.location.clone(),
            risk_score: i32::from(aggregate.risk_score),
            flagged: aggregate.escalate,
            flags: flags.clone(),
            ai_processed: assessment.ai_processed,
            created_at: now,
        };
        let case = aggregate.escalate.then(|| {
            CaseManager::escalation_case(
                tenant,
                Escalation {
                    transaction: &transaction,
                    analysis: &assessment.analysis,
                    detection_method: aggregate.detection_method,
                    pattern_matches: &pattern_matches,
                    max_rule_score: aggregate.max_rule_score,
                    ai_confidence: assessment.confidence,
                    created_by: ctx.user_id.as_deref(),
                },
            )
        });
        self.store.insert_scored(&transaction, case.as_ref()).await?;

        let case_id = case.map(|case| {
            info!(
                tenant_id = %tenant,
                case_id = %case.id,
                transaction_ref = %case.transaction_ref,
                risk_score = case.risk_score,
                "Transaction escalated to fraud case"
            );
            self.metrics.cases_escalated.inc();
            case.id
        });

        self.metrics.transactions_scored.inc();
        self.metrics.risk_scores.record(f64::from(aggregate.risk_score));
        if aggregate.escalate {
            self.metrics.transactions_flagged.inc();
        }

        info!(
            request_id = %ctx.request_id,
            tenant_id = %tenant,
            transaction_ref = %transaction.transaction_ref,
            risk_score = aggregate.risk_score,
            detection_method = aggregate.detection_method.as_str(),
            matched_patterns = pattern_matches.len(),
            escalated = aggregate.escalate,
            "Transaction scored"
        );

        Ok(FraudAnalysisResult {
            transaction_id: transaction.id,
            transaction_ref: transaction.transaction_ref,
            risk_score: aggregate.risk_score,
            confidence_level: assessment.confidence,
            detection_method: aggregate.detection_method,
            flags,
            ai_analysis: assessment.analysis,
            pattern_matches,
            flagged: aggregate.escalate,
            case_id,
        })
    }
}

/// AI flags first, then one `<type>_match` per matched pattern type
fn merge_flags(ai_flags: &[String], matches: &[PatternMatch]) -> Vec<String> {
    let mut flags: Vec<String> = Vec::with_capacity(ai_flags.len() + matches.len());
    let candidates = ai_flags
        .iter()
        .cloned()
        .chain(matches.iter().map(|m| format!("{}_match", m.pattern_type.as_str())));
    for flag in candidates {
        if !flag.is_empty() && !flags.contains(&flag) {
            flags.push(flag);
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::{AiError, DisabledGenerator, TextGenerator};
    use crate::domain::{CaseStatus, CreatePatternRequest, FraudPattern, PatternType};
    use crate::store::{CaseStore, MemoryStore, PatternStore, TransactionLedger};
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed(&'static str);

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _prompt: &str, _schema_hint: &str) -> std::result::Result<String, AiError> {
            Ok(self.0.to_string())
        }
    }

    /// Answers after a pause so concurrent analyses overlap
    struct Slow(&'static str);

    #[async_trait]
    impl TextGenerator for Slow {
        async fn generate(&self, _prompt: &str, _schema_hint: &str) -> std::result::Result<String, AiError> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(self.0.to_string())
        }
    }

    fn service(store: Arc<MemoryStore>, generator: Arc<dyn TextGenerator>) -> FraudDetectionService {
        FraudDetectionService::new(store, AiRiskAnalyst::new(generator), FraudMetrics::new())
            .with_user_locks(UserLocks::new())
    }

    fn request(id: &str) -> AnalyzeTransactionRequest {
        AnalyzeTransactionRequest {
            transaction_id: id.into(),
            amount: 2_500,
            currency: "usd".into(),
            transaction_type: "payment".into(),
            user_id: Some("user-1".into()),
            merchant: None,
            device: None,
            location: Some(json!({"country": "KP"})),
        }
    }

    async fn geo_pattern(store: &MemoryStore, tenant: TenantId) -> FraudPattern {
        let pattern = FraudPattern::from_request(
            tenant,
            CreatePatternRequest {
                name: "Sanctioned countries".into(),
                pattern_type: PatternType::Geographic,
                detection_rules: Some(json!({"restrictedCountries": ["KP"]})),
                thresholds: Some(json!({"restrictedCountryScore": 100})),
                is_active: Some(true),
            },
        );
        store.insert_pattern(&pattern).await.unwrap();
        pattern
    }

    #[test]
    fn test_merge_flags_dedups() {
        let matches = vec![
            PatternMatch {
                pattern_id: Uuid::new_v4(),
                pattern_name: "a".into(),
                pattern_type: PatternType::Velocity,
                confidence: 100,
                details: json!({}),
            },
            PatternMatch {
                pattern_id: Uuid::new_v4(),
                pattern_name: "b".into(),
                pattern_type: PatternType::Velocity,
                confidence: 40,
                details: json!({}),
            },
        ];
        let flags = merge_flags(&["velocity_match".into(), "odd_hour".into()], &matches);
        assert_eq!(flags, vec!["velocity_match", "odd_hour"]);
    }

    #[tokio::test]
    async fn test_ai_unavailable_without_patterns() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::generate();
        let result = service(store.clone(), Arc::new(DisabledGenerator))
            .analyze(&RequestContext::new(), tenant, request("tx-1"))
            .await
            .unwrap();

        assert_eq!(result.risk_score, 35);
        assert_eq!(result.confidence_level, 50);
        assert_eq!(result.detection_method, DetectionMethod::AiPattern);
        assert_eq!(result.flags, vec!["ai_technical_error"]);
        assert!(!result.flagged);
        assert!(result.case_id.is_none());

        let stored = store.get_transaction(tenant, result.transaction_id).await.unwrap().unwrap();
        assert_eq!(stored.risk_score, 35);
        assert_eq!(stored.currency, "USD");
        assert!(!stored.ai_processed);
    }

    #[tokio::test]
    async fn test_escalation_creates_case_and_counts_match() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::generate();
        let pattern = geo_pattern(&store, tenant).await;
        let generator = Arc::new(Fixed(
            r#"{"confidence": 90, "flags": ["sanctioned_region"], "summary": "High risk",
                "reasoning": "Restricted country", "recommendations": ["Block"], "patterns": ["geo"]}"#,
        ));

        let ctx = RequestContext::new().with_tenant(tenant).with_user("analyst-1");
        let result = service(store.clone(), generator)
            .analyze(&ctx, tenant, request("tx-2"))
            .await
            .unwrap();

        // round(90 * 0.7 + 100 * 0.3) = 93
        assert_eq!(result.risk_score, 93);
        assert_eq!(result.detection_method, DetectionMethod::Hybrid);
        assert_eq!(result.flags, vec!["sanctioned_region", "geographic_match"]);
        assert!(result.flagged);

        let case_id = result.case_id.unwrap();
        let case = store.get_case(tenant, case_id).await.unwrap().unwrap();
        assert_eq!(case.status, CaseStatus::Pending);
        assert_eq!(case.transaction_ref, "tx-2");
        assert_eq!(case.risk_score, 93);
        assert_eq!(case.anomaly_score, Some(100));
        assert_eq!(case.confidence_level, Some(90));
        assert_eq!(case.created_by.as_deref(), Some("analyst-1"));
        assert_eq!(case.ai_analysis.unwrap().summary, "High risk");

        let stored = store.get_pattern(tenant, pattern.id).await.unwrap().unwrap();
        assert_eq!(stored.match_count, 1);
        assert!(stored.last_matched_at.is_some());
    }

    #[tokio::test]
    async fn test_inactive_patterns_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::generate();
        let pattern = geo_pattern(&store, tenant).await;
        store
            .update_pattern(
                tenant,
                pattern.id,
                crate::domain::UpdatePatternRequest {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = service(store.clone(), Arc::new(Fixed(r#"{"confidence": 10}"#)))
            .analyze(&RequestContext::new(), tenant, request("tx-3"))
            .await
            .unwrap();
        assert_eq!(result.risk_score, 7);
        assert!(result.pattern_matches.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_scoring() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::generate();
        let mut req = request("tx-4");
        req.amount = -1;
        let err = service(store.clone(), Arc::new(DisabledGenerator))
            .analyze(&RequestContext::new(), tenant, req)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidRequest(_)));
        assert!(store.recent_transactions(tenant, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_case_write_stores_nothing() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::generate();
        geo_pattern(&store, tenant).await;
        store.reject_case_writes();

        // Below the threshold no case is written, so scoring still succeeds
        let calm = service(store.clone(), Arc::new(Fixed(r#"{"confidence": 10}"#)))
            .analyze(&RequestContext::new(), tenant, request("tx-5"))
            .await
            .unwrap();
        assert!(!calm.flagged);

        let err = service(store.clone(), Arc::new(Fixed(r#"{"confidence": 90}"#)))
            .analyze(&RequestContext::new(), tenant, request("tx-6"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Internal(_)));

        let stored = store.recent_transactions(tenant, None, 10).await.unwrap();
        let refs: Vec<&str> = stored.iter().map(|t| t.transaction_ref.as_str()).collect();
        assert_eq!(refs, vec!["tx-5"]);
        assert!(store.list_cases(tenant, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_scoring_for_one_user_is_serialized() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::generate();
        let velocity = FraudPattern::from_request(
            tenant,
            CreatePatternRequest {
                name: "Any repeat".into(),
                pattern_type: PatternType::Velocity,
                detection_rules: Some(json!({"timeWindowMinutes": 60})),
                thresholds: Some(json!({"maxTransactions": 0})),
                is_active: Some(true),
            },
        );
        store.insert_pattern(&velocity).await.unwrap();

        let detector = service(store.clone(), Arc::new(Slow(r#"{"confidence": 10}"#)));
        let mut handles = Vec::new();
        for id in ["tx-a", "tx-b"] {
            let detector = detector.clone();
            let mut req = request(id);
            req.location = None;
            handles.push(tokio::spawn(async move {
                detector.analyze(&RequestContext::new(), tenant, req).await
            }));
        }

        let mut velocity_hits = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            if result.flags.iter().any(|f| f == "velocity_match") {
                velocity_hits += 1;
                assert_eq!(result.risk_score, 37);
            } else {
                assert_eq!(result.risk_score, 7);
            }
        }
        assert_eq!(velocity_hits, 1);
        assert_eq!(store.recent_transactions(tenant, Some("user-1"), 10).await.unwrap().len(), 2);
    }
}
