//! Fraud case manager
//!
//! Manual case creation, automatic escalation from the scoring pipeline, and
//! partial updates. Cases are never deleted.

use std::sync::Arc;

use chrono::Utc;
use opsdesk_core::TenantId;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::domain::{
    AiAnalysis, CaseStatus, CreateCaseRequest, DetectionMethod, FraudCase, PatternMatch,
    ScoredTransaction, UpdateCaseRequest,
};
use crate::store::FraudStore;
use crate::{Error, Result};

/// Everything the pipeline knows when it escalates a transaction
#[derive(Debug, Clone)]
pub struct Escalation<'a> {
    pub transaction: &'a ScoredTransaction,
    pub analysis: &'a AiAnalysis,
    pub detection_method: DetectionMethod,
    pub pattern_matches: &'a [PatternMatch],
    pub max_rule_score: u8,
    pub ai_confidence: u8,
    pub created_by: Option<&'a str>,
}

#[derive(Clone)]
pub struct CaseManager {
    store: Arc<dyn FraudStore>,
    enforce_transitions: bool,
}

impl CaseManager {
    pub fn new(store: Arc<dyn FraudStore>, enforce_transitions: bool) -> Self {
        Self {
            store,
            enforce_transitions,
        }
    }

    pub async fn create(
        &self,
        tenant: TenantId,
        created_by: Option<&str>,
        req: CreateCaseRequest,
    ) -> Result<FraudCase> {
        req.validate()?;
        let now = Utc::now();
        let status = req.status.unwrap_or_default();
        let case = FraudCase {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            transaction_ref: req.transaction_id,
            amount: req.amount,
            currency: req.currency,
            risk_score: req.risk_score,
            status,
            flags: req.flags.unwrap_or_default(),
            assigned_to: req.assigned_to,
            notes: req.notes,
            ai_analysis: None,
            detection_method: DetectionMethod::Manual,
            pattern_matches: vec![],
            anomaly_score: None,
            confidence_level: None,
            created_by: created_by.map(str::to_string),
            created_at: now,
            updated_at: now,
            resolved_at: status.is_closed().then_some(now),
        };
        self.store.insert_case(&case).await?;

        info!(
            tenant_id = %tenant,
            case_id = %case.id,
            transaction_ref = %case.transaction_ref,
            "Fraud case created"
        );
        Ok(case)
    }

    /// Pending case for a transaction that crossed the threshold. The caller
    /// stores it together with the transaction.
    pub fn escalation_case(tenant: TenantId, escalation: Escalation<'_>) -> FraudCase {
        let txn = escalation.transaction;
        let now = Utc::now();
        FraudCase {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            transaction_ref: txn.transaction_ref.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
            risk_score: txn.risk_score,
            status: CaseStatus::Pending,
            flags: txn.flags.clone(),
            assigned_to: None,
            notes: None,
            ai_analysis: Some(escalation.analysis.clone()),
            detection_method: escalation.detection_method,
            pattern_matches: escalation.pattern_matches.to_vec(),
            anomaly_score: Some(i32::from(escalation.max_rule_score)),
            confidence_level: Some(i32::from(escalation.ai_confidence)),
            created_by: escalation.created_by.map(str::to_string),
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    pub async fn get(&self, tenant: TenantId, id: Uuid) -> Result<FraudCase> {
        self.store
            .get_case(tenant, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Case {}", id)))
    }

    pub async fn list(&self, tenant: TenantId, limit: usize) -> Result<Vec<FraudCase>> {
        self.store.list_cases(tenant, limit).await
    }

    pub async fn update(&self, tenant: TenantId, id: Uuid, req: UpdateCaseRequest) -> Result<FraudCase> {
        req.validate()?;
        if req.is_empty() {
            return Err(Error::InvalidRequest("no fields to update".into()));
        }

        let current = self.get(tenant, id).await?;
        let mut resolved_at = None;
        if let Some(next) = req.status {
            if self.enforce_transitions && !current.status.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    from: current.status.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            if next.is_closed() && !current.status.is_closed() {
                resolved_at = Some(Utc::now());
            }
        }

        let updated = self
            .store
            .update_case(tenant, id, &req, resolved_at)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Case {}", id)))?;

        info!(
            tenant_id = %tenant,
            case_id = %id,
            status = updated.status.as_str(),
            "Fraud case updated"
        );
        Ok(updated)
    }
}
