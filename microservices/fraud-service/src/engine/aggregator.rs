//! Final score arithmetic

use crate::domain::{DetectionMethod, ScoringPolicy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAggregate {
    pub risk_score: u8,
    pub detection_method: DetectionMethod,
    pub max_rule_score: u8,
    pub escalate: bool,
}

/// `round(ai * ai_weight + max(rule) * rule_weight)`. Any non-zero rule
/// score makes the method hybrid.
pub fn aggregate(policy: &ScoringPolicy, ai_confidence: u8, rule_scores: &[u8]) -> RiskAggregate {
    let max_rule_score = rule_scores.iter().copied().max().unwrap_or(0);
    let weighted = f64::from(ai_confidence) * policy.ai_weight
        + f64::from(max_rule_score) * policy.rule_weight;
    let risk_score = weighted.round().clamp(0.0, 100.0) as u8;

    let detection_method = if max_rule_score > 0 {
        DetectionMethod::Hybrid
    } else {
        DetectionMethod::AiPattern
    };

    RiskAggregate {
        risk_score,
        detection_method,
        max_rule_score,
        escalate: policy.should_escalate(risk_score),
    }
}
