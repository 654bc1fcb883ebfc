//! Tenant fraud statistics over a trailing day window

use chrono::{Duration, Utc};
use opsdesk_core::TenantId;
use serde::Serialize;

use crate::store::{FraudStore, PatternRanking};
use crate::{Error, Result};

pub const DEFAULT_WINDOW_DAYS: i64 = 30;
pub const MAX_WINDOW_DAYS: i64 = 3650;
pub const TOP_PATTERN_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudStatistics {
    pub total_transactions: u64,
    pub flagged_transactions: u64,
    /// Rounded to a whole percent
    pub flagged_percentage: u64,
    pub avg_risk_score: u64,
    pub top_patterns: Vec<PatternRanking>,
}

pub fn window_days(requested: Option<i64>) -> Result<i64> {
    let days = requested.unwrap_or(DEFAULT_WINDOW_DAYS);
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(Error::InvalidRequest(format!(
            "days must be between 1 and {}",
            MAX_WINDOW_DAYS
        )));
    }
    Ok(days)
}

pub async fn compute(store: &dyn FraudStore, tenant: TenantId, days: i64) -> Result<FraudStatistics> {
    let since = Utc::now() - Duration::days(days);
    let summary = store.transaction_summary(tenant, since).await?;
    let top_patterns = store.top_patterns(tenant, TOP_PATTERN_COUNT).await?;

    let flagged_percentage = if summary.total == 0 {
        0
    } else {
        (summary.flagged as f64 / summary.total as f64 * 100.0).round() as u64
    };

    Ok(FraudStatistics {
        total_transactions: summary.total,
        flagged_transactions: summary.flagged,
        flagged_percentage,
        avg_risk_score: summary.mean_risk_score.round().max(0.0) as u64,
        top_patterns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CreatePatternRequest, FraudPattern, PatternType, ScoredTransaction};
    use crate::store::{MemoryStore, PatternStore, TransactionLedger};
    use uuid::Uuid;

    fn scored(tenant: TenantId, risk_score: i32, flagged: bool, age_days: i64) -> ScoredTransaction {
        ScoredTransaction {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            transaction_ref: Uuid::new_v4().to_string(),
            amount: 100,
            currency: "USD".into(),
            transaction_type: "payment".into(),
            user_id: None,
            merchant: None,
            device: None,
            location: None,
            risk_score,
            flagged,
            flags: vec![],
            ai_processed: true,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn test_window_bounds() {
        assert_eq!(window_days(None).unwrap(), 30);
        assert_eq!(window_days(Some(1)).unwrap(), 1);
        assert!(window_days(Some(0)).is_err());
        assert!(window_days(Some(3651)).is_err());
    }

    #[tokio::test]
    async fn test_empty_tenant_has_zero_percentage() {
        let store = MemoryStore::new();
        let stats = compute(&store, TenantId::generate(), 30).await.unwrap();
        assert_eq!(stats.total_transactions, 0);
        assert_eq!(stats.flagged_percentage, 0);
        assert_eq!(stats.avg_risk_score, 0);
        assert!(stats.top_patterns.is_empty());
    }

    #[tokio::test]
    async fn test_window_and_rounding() {
        let store = MemoryStore::new();
        let tenant = TenantId::generate();
        for txn in [
            scored(tenant, 90, true, 1),
            scored(tenant, 20, false, 2),
            scored(tenant, 11, false, 3),
            scored(tenant, 99, true, 40),
            scored(TenantId::generate(), 99, true, 1),
        ] {
            store.insert_transaction(&txn).await.unwrap();
        }

        let stats = compute(&store, tenant, 30).await.unwrap();
        assert_eq!(stats.total_transactions, 3);
        assert_eq!(stats.flagged_transactions, 1);
        assert_eq!(stats.flagged_percentage, 33);
        // (90 + 20 + 11) / 3 = 40.33
        assert_eq!(stats.avg_risk_score, 40);
    }

    #[tokio::test]
    async fn test_top_patterns_capped_at_five() {
        let store = MemoryStore::new();
        let tenant = TenantId::generate();
        for i in 0..7 {
            let pattern = FraudPattern::from_request(
                tenant,
                CreatePatternRequest {
                    name: format!("p{}", i),
                    pattern_type: PatternType::Velocity,
                    detection_rules: None,
                    thresholds: None,
                    is_active: None,
                },
            );
            store.insert_pattern(&pattern).await.unwrap();
            for _ in 0..=i {
                store.record_pattern_match(tenant, pattern.id, Utc::now()).await.unwrap();
            }
        }

        let stats = compute(&store, tenant, 30).await.unwrap();
        assert_eq!(stats.top_patterns.len(), 5);
        assert_eq!(stats.top_patterns[0].name, "p6");
        assert_eq!(stats.top_patterns[0].match_count, 7);
    }
}
