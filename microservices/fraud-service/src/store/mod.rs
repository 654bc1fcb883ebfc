//! Persistence seams
//!
//! Every operation takes the owning tenant and must filter on it; a record
//! belonging to another tenant is indistinguishable from a missing one.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, SCHEMA};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsdesk_core::TenantId;
use uuid::Uuid;

use crate::domain::{
    FraudCase, FraudPattern, PatternType, ScoredTransaction, ScoringPolicy, UpdateCaseRequest,
    UpdatePatternRequest,
};
use crate::Result;

/// Tenant-defined detection patterns
#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn insert_pattern(&self, pattern: &FraudPattern) -> Result<()>;

    async fn get_pattern(&self, tenant: TenantId, id: Uuid) -> Result<Option<FraudPattern>>;

    /// Ordered by creation time, newest first
    async fn list_patterns(&self, tenant: TenantId, active_only: bool) -> Result<Vec<FraudPattern>>;

    async fn update_pattern(
        &self,
        tenant: TenantId,
        id: Uuid,
        update: UpdatePatternRequest,
    ) -> Result<Option<FraudPattern>>;

    /// Returns false when nothing was deleted
    async fn delete_pattern(&self, tenant: TenantId, id: Uuid) -> Result<bool>;

    /// Atomic `match_count += 1`, `last_matched_at = at`
    async fn record_pattern_match(&self, tenant: TenantId, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Patterns with at least one match, by match count descending
    async fn top_patterns(&self, tenant: TenantId, limit: usize) -> Result<Vec<PatternRanking>>;
}

/// Append-only log of scored transactions
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    async fn insert_transaction(&self, txn: &ScoredTransaction) -> Result<()>;

    async fn get_transaction(&self, tenant: TenantId, id: Uuid) -> Result<Option<ScoredTransaction>>;

    /// Newest first; restricted to `user_id` when given
    async fn recent_transactions(
        &self,
        tenant: TenantId,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredTransaction>>;

    async fn count_user_transactions_since(
        &self,
        tenant: TenantId,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Mean amount (minor units) of the user's transactions since `since`;
    /// `None` when there is no history
    async fn user_average_amount_since(
        &self,
        tenant: TenantId,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>>;

    async fn transaction_summary(&self, tenant: TenantId, since: DateTime<Utc>) -> Result<TransactionSummary>;
}

/// Fraud case persistence. There is deliberately no delete.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn insert_case(&self, case: &FraudCase) -> Result<()>;

    async fn get_case(&self, tenant: TenantId, id: Uuid) -> Result<Option<FraudCase>>;

    /// Newest first
    async fn list_cases(&self, tenant: TenantId, limit: usize) -> Result<Vec<FraudCase>>;

    async fn update_case(
        &self,
        tenant: TenantId,
        id: Uuid,
        update: &UpdateCaseRequest,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<Option<FraudCase>>;
}

/// Per-tenant scoring policy overrides
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self, tenant: TenantId) -> Result<Option<ScoringPolicy>>;

    async fn put_policy(&self, tenant: TenantId, policy: ScoringPolicy) -> Result<()>;
}

/// Everything the fraud service persists
#[async_trait]
pub trait FraudStore: PatternStore + TransactionLedger + CaseStore + PolicyStore {
    async fn is_healthy(&self) -> bool;

    fn backend_name(&self) -> &'static str;

    /// Write a scored transaction and, when it escalated, its case. Either
    /// both rows are stored or neither is.
    async fn insert_scored(&self, txn: &ScoredTransaction, case: Option<&FraudCase>) -> Result<()>;
}

/// Counts over a trailing window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransactionSummary {
    pub total: u64,
    pub flagged: u64,
    /// Mean risk score, 0 when `total == 0`
    pub mean_risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRanking {
    pub id: Uuid,
    pub name: String,
    pub pattern_type: PatternType,
    pub match_count: i64,
}
