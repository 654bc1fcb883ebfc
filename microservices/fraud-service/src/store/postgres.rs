//! PostgreSQL fraud store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsdesk_core::TenantId;
use opsdesk_db::{DbPool, Row};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tracing::instrument;
use uuid::Uuid;

use super::{
    CaseStore, FraudStore, PatternRanking, PatternStore, PolicyStore, TransactionLedger,
    TransactionSummary,
};
use crate::domain::{
    AiAnalysis, CaseStatus, DetectionMethod, FraudCase, FraudPattern, PatternMatch, PatternType,
    ScoredTransaction, ScoringPolicy, UpdateCaseRequest, UpdatePatternRequest,
};
use crate::{Error, Result};

/// Schema applied at startup
pub const SCHEMA: &str = include_str!("../../migrations/0001_fraud.sql");

const PATTERN_COLUMNS: &str = "id, tenant_id, name, pattern_type, detection_rules, thresholds, \
     is_active, match_count, last_matched_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, tenant_id, transaction_ref, amount, currency, \
     transaction_type, user_id, merchant, device, location, risk_score, flagged, flags, \
     ai_processed, created_at";

const CASE_COLUMNS: &str = "id, tenant_id, transaction_ref, amount, currency, risk_score, \
     status, flags, assigned_to, notes, ai_analysis, detection_method, pattern_matches, \
     anomaly_score, confidence_level, created_by, created_at, updated_at, resolved_at";

#[derive(Clone)]
pub struct PgStore {
    db: DbPool,
}

impl PgStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &DbPool {
        &self.db
    }

    fn row_to_pattern(row: &Row) -> Result<FraudPattern> {
        let pattern_type: String = row.try_get("pattern_type")?;
        Ok(FraudPattern {
            id: row.try_get("id")?,
            tenant_id: TenantId(row.try_get("tenant_id")?),
            name: row.try_get("name")?,
            pattern_type: PatternType::parse(&pattern_type),
            detection_rules: row.try_get("detection_rules")?,
            thresholds: row.try_get("thresholds")?,
            is_active: row.try_get("is_active")?,
            match_count: row.try_get("match_count")?,
            last_matched_at: row.try_get("last_matched_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_transaction(row: &Row) -> Result<ScoredTransaction> {
        Ok(ScoredTransaction {
            id: row.try_get("id")?,
            tenant_id: TenantId(row.try_get("tenant_id")?),
            transaction_ref: row.try_get("transaction_ref")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            transaction_type: row.try_get("transaction_type")?,
            user_id: row.try_get("user_id")?,
            merchant: row.try_get("merchant")?,
            device: row.try_get("device")?,
            location: row.try_get("location")?,
            risk_score: row.try_get("risk_score")?,
            flagged: row.try_get("flagged")?,
            flags: row.try_get("flags")?,
            ai_processed: row.try_get("ai_processed")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_case(row: &Row) -> Result<FraudCase> {
        let status: String = row.try_get("status")?;
        let method: String = row.try_get("detection_method")?;
        let ai_analysis: Option<Value> = row.try_get("ai_analysis")?;
        let pattern_matches: Value = row.try_get("pattern_matches")?;

        Ok(FraudCase {
            id: row.try_get("id")?,
            tenant_id: TenantId(row.try_get("tenant_id")?),
            transaction_ref: row.try_get("transaction_ref")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            risk_score: row.try_get("risk_score")?,
            status: CaseStatus::parse(&status)
                .ok_or_else(|| Error::Internal(format!("unknown case status '{}'", status)))?,
            flags: row.try_get("flags")?,
            assigned_to: row.try_get("assigned_to")?,
            notes: row.try_get("notes")?,
            ai_analysis: ai_analysis
                .map(serde_json::from_value::<AiAnalysis>)
                .transpose()?,
            detection_method: DetectionMethod::parse(&method)
                .ok_or_else(|| Error::Internal(format!("unknown detection method '{}'", method)))?,
            pattern_matches: serde_json::from_value::<Vec<PatternMatch>>(pattern_matches)?,
            anomaly_score: row.try_get("anomaly_score")?,
            confidence_level: row.try_get("confidence_level")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

#[async_trait]
impl PatternStore for PgStore {
    #[instrument(skip(self, pattern), fields(tenant_id = %pattern.tenant_id))]
    async fn insert_pattern(&self, pattern: &FraudPattern) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO fraud_patterns ({}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                    PATTERN_COLUMNS
                ),
                &[
                    &pattern.id,
                    pattern.tenant_id.as_uuid(),
                    &pattern.name,
                    &pattern.pattern_type.as_str(),
                    &pattern.detection_rules,
                    &pattern.thresholds,
                    &pattern.is_active,
                    &pattern.match_count,
                    &pattern.last_matched_at,
                    &pattern.created_at,
                    &pattern.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_pattern(&self, tenant: TenantId, id: Uuid) -> Result<Option<FraudPattern>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM fraud_patterns WHERE id = $1 AND tenant_id = $2",
                    PATTERN_COLUMNS
                ),
                &[&id, tenant.as_uuid()],
            )
            .await?;
        row.as_ref().map(Self::row_to_pattern).transpose()
    }

    async fn list_patterns(&self, tenant: TenantId, active_only: bool) -> Result<Vec<FraudPattern>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM fraud_patterns \
                     WHERE tenant_id = $1 AND (NOT $2 OR is_active) \
                     ORDER BY created_at DESC",
                    PATTERN_COLUMNS
                ),
                &[tenant.as_uuid(), &active_only],
            )
            .await?;
        rows.iter().map(Self::row_to_pattern).collect()
    }

    async fn update_pattern(
        &self,
        tenant: TenantId,
        id: Uuid,
        update: UpdatePatternRequest,
    ) -> Result<Option<FraudPattern>> {
        let client = self.db.get().await?;
        let pattern_type = update.pattern_type.map(|t| t.as_str());
        let row = client
            .query_opt(
                &format!(
                    "UPDATE fraud_patterns SET \
                        name = COALESCE($3, name), \
                        pattern_type = COALESCE($4, pattern_type), \
                        detection_rules = COALESCE($5, detection_rules), \
                        thresholds = COALESCE($6, thresholds), \
                        is_active = COALESCE($7, is_active), \
                        updated_at = now() \
                     WHERE id = $1 AND tenant_id = $2 \
                     RETURNING {}",
                    PATTERN_COLUMNS
                ),
                &[
                    &id,
                    tenant.as_uuid(),
                    &update.name,
                    &pattern_type,
                    &update.detection_rules,
                    &update.thresholds,
                    &update.is_active,
                ],
            )
            .await?;
        row.as_ref().map(Self::row_to_pattern).transpose()
    }

    async fn delete_pattern(&self, tenant: TenantId, id: Uuid) -> Result<bool> {
        let client = self.db.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM fraud_patterns WHERE id = $1 AND tenant_id = $2",
                &[&id, tenant.as_uuid()],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn record_pattern_match(&self, tenant: TenantId, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                "UPDATE fraud_patterns \
                 SET match_count = match_count + 1, last_matched_at = $3 \
                 WHERE id = $1 AND tenant_id = $2",
                &[&id, tenant.as_uuid(), &at],
            )
            .await?;
        Ok(())
    }

    async fn top_patterns(&self, tenant: TenantId, limit: usize) -> Result<Vec<PatternRanking>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                "SELECT id, name, pattern_type, match_count FROM fraud_patterns \
                 WHERE tenant_id = $1 AND match_count > 0 \
                 ORDER BY match_count DESC, name ASC \
                 LIMIT $2",
                &[tenant.as_uuid(), &(limit as i64)],
            )
            .await?;
        rows.iter()
            .map(|row| -> Result<PatternRanking> {
                let pattern_type: String = row.try_get("pattern_type")?;
                Ok(PatternRanking {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    pattern_type: PatternType::parse(&pattern_type),
                    match_count: row.try_get("match_count")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TransactionLedger for PgStore {
    #[instrument(skip(self, txn), fields(tenant_id = %txn.tenant_id, transaction_ref = %txn.transaction_ref))]
    async fn insert_transaction(&self, txn: &ScoredTransaction) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(&insert_transaction_sql(), &transaction_params(txn))
            .await?;
        Ok(())
    }

    async fn get_transaction(&self, tenant: TenantId, id: Uuid) -> Result<Option<ScoredTransaction>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM fraud_transactions WHERE id = $1 AND tenant_id = $2",
                    TRANSACTION_COLUMNS
                ),
                &[&id, tenant.as_uuid()],
            )
            .await?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn recent_transactions(
        &self,
        tenant: TenantId,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredTransaction>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM fraud_transactions \
                     WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR user_id = $2) \
                     ORDER BY created_at DESC \
                     LIMIT $3",
                    TRANSACTION_COLUMNS
                ),
                &[tenant.as_uuid(), &user_id, &(limit as i64)],
            )
            .await?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn count_user_transactions_since(
        &self,
        tenant: TenantId,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let client = self.db.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*)::BIGINT AS total FROM fraud_transactions \
                 WHERE tenant_id = $1 AND user_id = $2 AND created_at >= $3",
                &[tenant.as_uuid(), &user_id, &since],
            )
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn user_average_amount_since(
        &self,
        tenant: TenantId,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let client = self.db.get().await?;
        let row = client
            .query_one(
                "SELECT AVG(amount)::FLOAT8 AS mean FROM fraud_transactions \
                 WHERE tenant_id = $1 AND user_id = $2 AND created_at >= $3",
                &[tenant.as_uuid(), &user_id, &since],
            )
            .await?;
        Ok(row.try_get("mean")?)
    }

    async fn transaction_summary(&self, tenant: TenantId, since: DateTime<Utc>) -> Result<TransactionSummary> {
        let client = self.db.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*)::BIGINT AS total, \
                        COUNT(*) FILTER (WHERE flagged)::BIGINT AS flagged, \
                        COALESCE(AVG(risk_score), 0)::FLOAT8 AS mean_risk \
                 FROM fraud_transactions \
                 WHERE tenant_id = $1 AND created_at >= $2",
                &[tenant.as_uuid(), &since],
            )
            .await?;
        let total: i64 = row.try_get("total")?;
        let flagged: i64 = row.try_get("flagged")?;
        Ok(TransactionSummary {
            total: total.max(0) as u64,
            flagged: flagged.max(0) as u64,
            mean_risk_score: row.try_get("mean_risk")?,
        })
    }
}

#[async_trait]
impl CaseStore for PgStore {
    #[instrument(skip(self, case), fields(tenant_id = %case.tenant_id, case_id = %case.id))]
    async fn insert_case(&self, case: &FraudCase) -> Result<()> {
        let encoded = EncodedCase::new(case)?;
        let client = self.db.get().await?;
        client
            .execute(&insert_case_sql(), &case_params(case, &encoded))
            .await?;
        Ok(())
    }

    async fn get_case(&self, tenant: TenantId, id: Uuid) -> Result<Option<FraudCase>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM fraud_cases WHERE id = $1 AND tenant_id = $2",
                    CASE_COLUMNS
                ),
                &[&id, tenant.as_uuid()],
            )
            .await?;
        row.as_ref().map(Self::row_to_case).transpose()
    }

    async fn list_cases(&self, tenant: TenantId, limit: usize) -> Result<Vec<FraudCase>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM fraud_cases WHERE tenant_id = $1 \
                     ORDER BY created_at DESC LIMIT $2",
                    CASE_COLUMNS
                ),
                &[tenant.as_uuid(), &(limit as i64)],
            )
            .await?;
        rows.iter().map(Self::row_to_case).collect()
    }

    async fn update_case(
        &self,
        tenant: TenantId,
        id: Uuid,
        update: &UpdateCaseRequest,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<Option<FraudCase>> {
        let status = update.status.map(|s| s.as_str());
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE fraud_cases SET \
                        status = COALESCE($3, status), \
                        notes = COALESCE($4, notes), \
                        assigned_to = COALESCE($5, assigned_to), \
                        resolved_at = COALESCE($6, resolved_at), \
                        updated_at = now() \
                     WHERE id = $1 AND tenant_id = $2 \
                     RETURNING {}",
                    CASE_COLUMNS
                ),
                &[
                    &id,
                    tenant.as_uuid(),
                    &status,
                    &update.notes,
                    &update.assigned_to,
                    &resolved_at,
                ],
            )
            .await?;
        row.as_ref().map(Self::row_to_case).transpose()
    }
}

#[async_trait]
impl PolicyStore for PgStore {
    async fn get_policy(&self, tenant: TenantId) -> Result<Option<ScoringPolicy>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT escalation_threshold, ai_weight, rule_weight \
                 FROM fraud_scoring_policies WHERE tenant_id = $1",
                &[tenant.as_uuid()],
            )
            .await?;
        row.map(|row| -> Result<ScoringPolicy> {
            let threshold: i16 = row.try_get("escalation_threshold")?;
            Ok(ScoringPolicy {
                escalation_threshold: threshold.clamp(0, 100) as u8,
                ai_weight: row.try_get("ai_weight")?,
                rule_weight: row.try_get("rule_weight")?,
            })
        })
        .transpose()
    }

    async fn put_policy(&self, tenant: TenantId, policy: ScoringPolicy) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                "INSERT INTO fraud_scoring_policies \
                    (tenant_id, escalation_threshold, ai_weight, rule_weight, updated_at) \
                 VALUES ($1, $2, $3, $4, now()) \
                 ON CONFLICT (tenant_id) DO UPDATE SET \
                    escalation_threshold = EXCLUDED.escalation_threshold, \
                    ai_weight = EXCLUDED.ai_weight, \
                    rule_weight = EXCLUDED.rule_weight, \
                    updated_at = now()",
                &[
                    tenant.as_uuid(),
                    &(policy.escalation_threshold as i16),
                    &policy.ai_weight,
                    &policy.rule_weight,
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FraudStore for PgStore {
    async fn is_healthy(&self) -> bool {
        self.db.is_healthy().await
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn insert_scored(&self, txn: &ScoredTransaction, case: Option<&FraudCase>) -> Result<()> {
        let encoded = case.map(EncodedCase::new).transpose()?;
        let mut client = self.db.get().await?;
        let tx = client.transaction().await?;
        tx.execute(&insert_transaction_sql(), &transaction_params(txn))
            .await?;
        if let (Some(case), Some(encoded)) = (case, encoded.as_ref()) {
            tx.execute(&insert_case_sql(), &case_params(case, encoded))
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn insert_transaction_sql() -> String {
    format!(
        "INSERT INTO fraud_transactions ({}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        TRANSACTION_COLUMNS
    )
}

fn transaction_params(txn: &ScoredTransaction) -> [&(dyn ToSql + Sync); 15] {
    [
        &txn.id,
        txn.tenant_id.as_uuid(),
        &txn.transaction_ref,
        &txn.amount,
        &txn.currency,
        &txn.transaction_type,
        &txn.user_id,
        &txn.merchant,
        &txn.device,
        &txn.location,
        &txn.risk_score,
        &txn.flagged,
        &txn.flags,
        &txn.ai_processed,
        &txn.created_at,
    ]
}

/// Case columns stored as text or JSONB
struct EncodedCase {
    status: &'static str,
    detection_method: &'static str,
    ai_analysis: Option<Value>,
    pattern_matches: Value,
}

impl EncodedCase {
    fn new(case: &FraudCase) -> Result<Self> {
        Ok(Self {
            status: case.status.as_str(),
            detection_method: case.detection_method.as_str(),
            ai_analysis: case.ai_analysis.as_ref().map(serde_json::to_value).transpose()?,
            pattern_matches: serde_json::to_value(&case.pattern_matches)?,
        })
    }
}

fn insert_case_sql() -> String {
    format!(
        "INSERT INTO fraud_cases ({}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
          $11, $12, $13, $14, $15, $16, $17, $18, $19)",
        CASE_COLUMNS
    )
}

fn case_params<'a>(case: &'a FraudCase, encoded: &'a EncodedCase) -> [&'a (dyn ToSql + Sync); 19] {
    [
        &case.id,
        case.tenant_id.as_uuid(),
        &case.transaction_ref,
        &case.amount,
        &case.currency,
        &case.risk_score,
        &encoded.status,
        &case.flags,
        &case.assigned_to,
        &case.notes,
        &encoded.ai_analysis,
        &encoded.detection_method,
        &encoded.pattern_matches,
        &case.anomaly_score,
        &case.confidence_level,
        &case.created_by,
        &case.created_at,
        &case.updated_at,
        &case.resolved_at,
    ]
}
