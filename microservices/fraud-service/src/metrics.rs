//! In-process scoring metrics, exposed on `/stats`

use opsdesk_telemetry::{Counter, Gauge, Histogram};
use serde::Serialize;

#[derive(Clone)]
pub struct FraudMetrics {
    pub transactions_scored: Counter,
    pub transactions_flagged: Counter,
    pub cases_escalated: Counter,
    pub ai_fallbacks: Counter,
    pub pattern_matches: Counter,
    pub rate_limited: Counter,
    pub in_flight: Gauge,
    pub scoring_latency_ms: Histogram,
    pub risk_scores: Histogram,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub transactions_scored: u64,
    pub transactions_flagged: u64,
    pub cases_escalated: u64,
    pub ai_fallbacks: u64,
    pub pattern_matches: u64,
    pub rate_limited: u64,
    pub in_flight: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub mean_risk_score: f64,
}

impl FraudMetrics {
    pub fn new() -> Self {
        Self {
            transactions_scored: Counter::new("fraud_transactions_scored_total"),
            transactions_flagged: Counter::new("fraud_transactions_flagged_total"),
            cases_escalated: Counter::new("fraud_cases_escalated_total"),
            ai_fallbacks: Counter::new("fraud_ai_fallbacks_total"),
            pattern_matches: Counter::new("fraud_pattern_matches_total"),
            rate_limited: Counter::new("fraud_rate_limited_total"),
            in_flight: Gauge::new("fraud_scoring_in_flight"),
            scoring_latency_ms: Histogram::new("fraud_scoring_latency_ms"),
            risk_scores: Histogram::with_capacity("fraud_risk_score", 1_000),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_scored: self.transactions_scored.get(),
            transactions_flagged: self.transactions_flagged.get(),
            cases_escalated: self.cases_escalated.get(),
            ai_fallbacks: self.ai_fallbacks.get(),
            pattern_matches: self.pattern_matches.get(),
            rate_limited: self.rate_limited.get(),
            in_flight: self.in_flight.get(),
            latency_p50_ms: self.scoring_latency_ms.percentile(50.0),
            latency_p99_ms: self.scoring_latency_ms.percentile(99.0),
            mean_risk_score: self.risk_scores.mean(),
        }
    }
}

impl Default for FraudMetrics {
    fn default() -> Self {
        Self::new()
    }
}
