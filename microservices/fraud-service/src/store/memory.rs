//! In-memory fraud store
//!
//! Same semantics as the PostgreSQL store; backs tests and single-node runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opsdesk_core::TenantId;
use uuid::Uuid;

use super::{
    CaseStore, FraudStore, PatternRanking, PatternStore, PolicyStore, TransactionLedger,
    TransactionSummary,
};
use crate::domain::{
    FraudCase, FraudPattern, ScoredTransaction, ScoringPolicy, UpdateCaseRequest,
    UpdatePatternRequest,
};
use crate::Result;

#[derive(Default)]
pub struct MemoryStore {
    patterns: DashMap<Uuid, FraudPattern>,
    transactions: DashMap<Uuid, ScoredTransaction>,
    cases: DashMap<Uuid, FraudCase>,
    policies: DashMap<TenantId, ScoringPolicy>,
    #[cfg(test)]
    reject_cases: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_transactions_since(
        &self,
        tenant: TenantId,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Vec<i64> {
        self.transactions
            .iter()
            .filter(|t| {
                t.tenant_id == tenant
                    && t.user_id.as_deref() == Some(user_id)
                    && t.created_at >= since
            })
            .map(|t| t.amount)
            .collect()
    }

    /// Make every case write fail
    #[cfg(test)]
    pub(crate) fn reject_case_writes(&self) {
        self.reject_cases.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_case_write(&self) -> Result<()> {
        #[cfg(test)]
        if self.reject_cases.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::Error::Internal("case writes rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn insert_pattern(&self, pattern: &FraudPattern) -> Result<()> {
        self.patterns.insert(pattern.id, pattern.clone());
        Ok(())
    }

    async fn get_pattern(&self, tenant: TenantId, id: Uuid) -> Result<Option<FraudPattern>> {
        Ok(self
            .patterns
            .get(&id)
            .filter(|p| p.tenant_id == tenant)
            .map(|p| p.clone()))
    }

    async fn list_patterns(&self, tenant: TenantId, active_only: bool) -> Result<Vec<FraudPattern>> {
        let mut patterns: Vec<FraudPattern> = self
            .patterns
            .iter()
            .filter(|p| p.tenant_id == tenant && (!active_only || p.is_active))
            .map(|p| p.clone())
            .collect();
        patterns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(patterns)
    }

    async fn update_pattern(
        &self,
        tenant: TenantId,
        id: Uuid,
        update: UpdatePatternRequest,
    ) -> Result<Option<FraudPattern>> {
        match self.patterns.get_mut(&id) {
            Some(mut pattern) if pattern.tenant_id == tenant => {
                pattern.apply_update(update);
                Ok(Some(pattern.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_pattern(&self, tenant: TenantId, id: Uuid) -> Result<bool> {
        Ok(self
            .patterns
            .remove_if(&id, |_, p| p.tenant_id == tenant)
            .is_some())
    }

    async fn record_pattern_match(&self, tenant: TenantId, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut pattern) = self.patterns.get_mut(&id) {
            if pattern.tenant_id == tenant {
                pattern.match_count += 1;
                pattern.last_matched_at = Some(at);
            }
        }
        Ok(())
    }

    async fn top_patterns(&self, tenant: TenantId, limit: usize) -> Result<Vec<PatternRanking>> {
        let mut ranked: Vec<PatternRanking> = self
            .patterns
            .iter()
            .filter(|p| p.tenant_id == tenant && p.match_count > 0)
            .map(|p| PatternRanking {
                id: p.id,
                name: p.name.clone(),
                pattern_type: p.pattern_type,
                match_count: p.match_count,
            })
            .collect();
        ranked.sort_by(|a, b| b.match_count.cmp(&a.match_count).then_with(|| a.name.cmp(&b.name)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}

#[async_trait]
impl TransactionLedger for MemoryStore {
    async fn insert_transaction(&self, txn: &ScoredTransaction) -> Result<()> {
        self.transactions.insert(txn.id, txn.clone());
        Ok(())
    }

    async fn get_transaction(&self, tenant: TenantId, id: Uuid) -> Result<Option<ScoredTransaction>> {
        Ok(self
            .transactions
            .get(&id)
            .filter(|t| t.tenant_id == tenant)
            .map(|t| t.clone()))
    }

    async fn recent_transactions(
        &self,
        tenant: TenantId,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredTransaction>> {
        let mut txns: Vec<ScoredTransaction> = self
            .transactions
            .iter()
            .filter(|t| {
                t.tenant_id == tenant && user_id.map_or(true, |u| t.user_id.as_deref() == Some(u))
            })
            .map(|t| t.clone())
            .collect();
        txns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        txns.truncate(limit);
        Ok(txns)
    }

    async fn count_user_transactions_since(
        &self,
        tenant: TenantId,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self.user_transactions_since(tenant, user_id, since).len() as u64)
    }

    async fn user_average_amount_since(
        &self,
        tenant: TenantId,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let amounts = self.user_transactions_since(tenant, user_id, since);
        if amounts.is_empty() {
            return Ok(None);
        }
        let total: f64 = amounts.iter().map(|a| *a as f64).sum();
        Ok(Some(total / amounts.len() as f64))
    }

    async fn transaction_summary(&self, tenant: TenantId, since: DateTime<Utc>) -> Result<TransactionSummary> {
        let mut summary = TransactionSummary::default();
        let mut score_sum = 0.0;
        for txn in self
            .transactions
            .iter()
            .filter(|t| t.tenant_id == tenant && t.created_at >= since)
        {
            summary.total += 1;
            if txn.flagged {
                summary.flagged += 1;
            }
            score_sum += txn.risk_score as f64;
        }
        if summary.total > 0 {
            summary.mean_risk_score = score_sum / summary.total as f64;
        }
        Ok(summary)
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn insert_case(&self, case: &FraudCase) -> Result<()> {
        self.check_case_write()?;
        self.cases.insert(case.id, case.clone());
        Ok(())
    }

    async fn get_case(&self, tenant: TenantId, id: Uuid) -> Result<Option<FraudCase>> {
        Ok(self
            .cases
            .get(&id)
            .filter(|c| c.tenant_id == tenant)
            .map(|c| c.clone()))
    }

    async fn list_cases(&self, tenant: TenantId, limit: usize) -> Result<Vec<FraudCase>> {
        let mut cases: Vec<FraudCase> = self
            .cases
            .iter()
            .filter(|c| c.tenant_id == tenant)
            .map(|c| c.clone())
            .collect();
        cases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        cases.truncate(limit);
        Ok(cases)
    }

    async fn update_case(
        &self,
        tenant: TenantId,
        id: Uuid,
        update: &UpdateCaseRequest,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<Option<FraudCase>> {
        match self.cases.get_mut(&id) {
            Some(mut case) if case.tenant_id == tenant => {
                if let Some(status) = update.status {
                    case.status = status;
                }
                if let Some(notes) = &update.notes {
                    case.notes = Some(notes.clone());
                }
                if let Some(assignee) = &update.assigned_to {
                    case.assigned_to = Some(assignee.clone());
                }
                if resolved_at.is_some() {
                    case.resolved_at = resolved_at;
                }
                case.updated_at = Utc::now();
                Ok(Some(case.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get_policy(&self, tenant: TenantId) -> Result<Option<ScoringPolicy>> {
        Ok(self.policies.get(&tenant).map(|p| *p))
    }

    async fn put_policy(&self, tenant: TenantId, policy: ScoringPolicy) -> Result<()> {
        self.policies.insert(tenant, policy);
        Ok(())
    }
}

#[async_trait]
impl FraudStore for MemoryStore {
    async fn is_healthy(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert_scored(&self, txn: &ScoredTransaction, case: Option<&FraudCase>) -> Result<()> {
        if let Some(case) = case {
            self.check_case_write()?;
            self.cases.insert(case.id, case.clone());
        }
        self.transactions.insert(txn.id, txn.clone());
        Ok(())
    }
}
