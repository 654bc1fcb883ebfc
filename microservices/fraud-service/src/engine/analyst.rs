//! AI risk analyst
//!
//! Renders the transaction, its recent history and the tenant's active
//! patterns into one prompt, asks the text generator for a JSON verdict, and
//! substitutes a fixed fallback whenever the call or the parse fails.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ai_client::{AiError, TextGenerator};
use crate::domain::{AiAnalysis, AnalyzeTransactionRequest, FraudPattern, ScoredTransaction};

/// Upper bound on history rows embedded in the prompt
pub const HISTORY_LIMIT: usize = 10;

pub const PARSE_ERROR_FLAG: &str = "ai_parse_error";
pub const TECHNICAL_ERROR_FLAG: &str = "ai_technical_error";

const FALLBACK_CONFIDENCE: u8 = 50;
const FALLBACK_RECOMMENDATION: &str = "Manual review recommended";

const SCHEMA_HINT: &str = r#"{
  "confidence": number (0-100, likelihood the transaction is fraudulent),
  "flags": string[],
  "summary": string,
  "reasoning": string,
  "recommendations": string[],
  "patterns": string[]
}"#;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("text generation failed: {0}")]
    Upstream(#[from] AiError),

    #[error("no JSON object in completion")]
    NoJson,

    #[error("malformed analysis JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Verdict as returned by the model, before clamping
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedAnalysis {
    pub confidence: f64,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// What the pipeline consumes from the analyst
#[derive(Debug, Clone, PartialEq)]
pub struct AiAssessment {
    pub confidence: u8,
    pub flags: Vec<String>,
    pub analysis: AiAnalysis,
    /// False when the fallback was substituted
    pub ai_processed: bool,
}

impl AiAssessment {
    fn from_parsed(parsed: ParsedAnalysis) -> Self {
        Self {
            confidence: clamp_confidence(parsed.confidence),
            flags: parsed.flags,
            analysis: AiAnalysis {
                summary: parsed.summary,
                reasoning: parsed.reasoning,
                recommendations: parsed.recommendations,
                patterns: parsed.patterns,
            },
            ai_processed: true,
        }
    }

    pub fn fallback(err: &AnalysisError) -> Self {
        let (flag, summary, reasoning) = match err {
            AnalysisError::Upstream(_) => (
                TECHNICAL_ERROR_FLAG,
                "AI analysis unavailable due to a technical error",
                "The analysis service could not be reached; score is based on rule evaluation",
            ),
            AnalysisError::NoJson | AnalysisError::Malformed(_) => (
                PARSE_ERROR_FLAG,
                "AI analysis could not be interpreted",
                "The analysis response was not valid JSON; score is based on rule evaluation",
            ),
        };
        Self {
            confidence: FALLBACK_CONFIDENCE,
            flags: vec![flag.to_string()],
            analysis: AiAnalysis {
                summary: summary.to_string(),
                reasoning: reasoning.to_string(),
                recommendations: vec![FALLBACK_RECOMMENDATION.to_string()],
                patterns: vec![],
            },
            ai_processed: false,
        }
    }
}

fn clamp_confidence(raw: f64) -> u8 {
    if raw.is_nan() {
        return FALLBACK_CONFIDENCE;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

/// Pull the outermost `{...}` out of a completion and decode it.
/// Models often wrap JSON in prose or code fences.
pub fn parse_analysis(text: &str) -> Result<ParsedAnalysis, AnalysisError> {
    let start = text.find('{').ok_or(AnalysisError::NoJson)?;
    let end = text.rfind('}').ok_or(AnalysisError::NoJson)?;
    if end < start {
        return Err(AnalysisError::NoJson);
    }
    Ok(serde_json::from_str(&text[start..=end])?)
}

#[derive(Clone)]
pub struct AiRiskAnalyst {
    generator: Arc<dyn TextGenerator>,
    timeout: Option<Duration>,
}

impl AiRiskAnalyst {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            timeout: None,
        }
    }

    /// Outer bound on one generation call; expiry counts as an upstream failure
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Typed capability over the generator; errors are surfaced, not masked
    pub async fn analyze(
        &self,
        txn: &AnalyzeTransactionRequest,
        history: &[ScoredTransaction],
        patterns: &[FraudPattern],
    ) -> Result<ParsedAnalysis, AnalysisError> {
        let prompt = build_prompt(txn, history, patterns);
        let call = self.generator.generate(&prompt, SCHEMA_HINT);
        let text = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| AiError::Timeout)??,
            None => call.await?,
        };
        debug!(completion_len = text.len(), "AI analysis received");
        parse_analysis(&text)
    }

    /// Never fails; substitutes the fallback assessment on any error
    pub async fn assess(
        &self,
        txn: &AnalyzeTransactionRequest,
        history: &[ScoredTransaction],
        patterns: &[FraudPattern],
    ) -> AiAssessment {
        match self.analyze(txn, history, patterns).await {
            Ok(parsed) => AiAssessment::from_parsed(parsed),
            Err(e) => {
                warn!(
                    transaction = %txn.transaction_id,
                    error = %e,
                    "AI analysis failed, using fallback"
                );
                AiAssessment::fallback(&e)
            }
        }
    }
}

pub fn build_prompt(
    txn: &AnalyzeTransactionRequest,
    history: &[ScoredTransaction],
    patterns: &[FraudPattern],
) -> String {
    let mut out = String::with_capacity(2048);

    out.push_str(
        "You are a fraud analyst reviewing a payment transaction. \
         Assess how likely it is to be fraudulent.\n\n",
    );

    out.push_str("Transaction:\n");
    let _ = writeln!(out, "- Reference: {}", txn.transaction_id);
    let _ = writeln!(out, "- Amount: {} {} (minor units)", txn.amount, txn.currency);
    let _ = writeln!(out, "- Type: {}", txn.transaction_type);
    let _ = writeln!(out, "- User: {}", txn.user_id.as_deref().unwrap_or("unknown"));
    for (label, value) in [
        ("Merchant", &txn.merchant),
        ("Device", &txn.device),
        ("Location", &txn.location),
    ] {
        if let Some(value) = value {
            let _ = writeln!(out, "- {}: {}", label, value);
        }
    }

    out.push_str("\nRecent transactions (newest first):\n");
    if history.is_empty() {
        out.push_str("- none\n");
    }
    for past in history.iter().take(HISTORY_LIMIT) {
        let _ = writeln!(
            out,
            "- {} | {} {} | {} | risk {}{}",
            past.created_at.to_rfc3339(),
            past.amount,
            past.currency,
            past.transaction_type,
            past.risk_score,
            if past.flagged { " | flagged" } else { "" }
        );
    }

    out.push_str("\nActive fraud patterns:\n");
    if patterns.is_empty() {
        out.push_str("- none\n");
    }
    for pattern in patterns {
        let _ = writeln!(
            out,
            "- {} ({}): rules {} thresholds {}",
            pattern.name,
            pattern.pattern_type.as_str(),
            pattern.detection_rules,
            pattern.thresholds
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use opsdesk_core::TenantId;
    use uuid::Uuid;

    struct Scripted(Result<String, fn() -> AiError>);

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _prompt: &str, _schema_hint: &str) -> Result<String, AiError> {
            match &self.0 {
                Ok(text) => Ok(text.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn analyst(reply: Result<String, fn() -> AiError>) -> AiRiskAnalyst {
        AiRiskAnalyst::new(Arc::new(Scripted(reply)))
    }

    fn txn() -> AnalyzeTransactionRequest {
        AnalyzeTransactionRequest {
            transaction_id: "tx-42".into(),
            amount: 12_500,
            currency: "EUR".into(),
            transaction_type: "payment".into(),
            user_id: Some("user-7".into()),
            merchant: Some(serde_json::json!({"name": "Acme"})),
            device: None,
            location: None,
        }
    }

    #[test]
    fn test_parse_extracts_embedded_object() {
        let parsed = parse_analysis(
            "Here you go:\n```json\n{\"confidence\": 82, \"flags\": [\"new_device\"]}\n```",
        )
        .unwrap();
        assert_eq!(parsed.confidence, 82.0);
        assert_eq!(parsed.flags, vec!["new_device"]);
        assert!(parsed.recommendations.is_empty());
    }

    #[test]
    fn test_parse_requires_confidence() {
        assert!(matches!(
            parse_analysis("{\"flags\": []}"),
            Err(AnalysisError::Malformed(_))
        ));
        assert!(matches!(parse_analysis("no json here"), Err(AnalysisError::NoJson)));
        assert!(matches!(parse_analysis("} {"), Err(AnalysisError::NoJson)));
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(clamp_confidence(150.0), 100);
        assert_eq!(clamp_confidence(-3.0), 0);
        assert_eq!(clamp_confidence(64.5), 65);
    }

    #[tokio::test]
    async fn test_assess_success() {
        let reply = r#"{"confidence": 140, "flags": ["card_testing"], "summary": "s",
            "reasoning": "r", "recommendations": ["block"], "patterns": ["velocity"]}"#;
        let assessment = analyst(Ok(reply.to_string())).assess(&txn(), &[], &[]).await;
        assert_eq!(assessment.confidence, 100);
        assert!(assessment.ai_processed);
        assert_eq!(assessment.flags, vec!["card_testing"]);
        assert_eq!(assessment.analysis.patterns, vec!["velocity"]);
    }

    #[tokio::test]
    async fn test_assess_parse_fallback() {
        let assessment = analyst(Ok("I think it's fine".into())).assess(&txn(), &[], &[]).await;
        assert_eq!(assessment.confidence, 50);
        assert_eq!(assessment.flags, vec![PARSE_ERROR_FLAG]);
        assert_eq!(assessment.analysis.recommendations, vec!["Manual review recommended"]);
        assert!(assessment.analysis.patterns.is_empty());
        assert!(!assessment.ai_processed);
    }

    #[tokio::test]
    async fn test_assess_upstream_fallback() {
        let assessment = analyst(Err(|| AiError::Timeout)).assess(&txn(), &[], &[]).await;
        assert_eq!(assessment.confidence, 50);
        assert_eq!(assessment.flags, vec![TECHNICAL_ERROR_FLAG]);
        assert!(!assessment.ai_processed);
    }

    struct Hung;

    #[async_trait]
    impl TextGenerator for Hung {
        async fn generate(&self, _prompt: &str, _schema_hint: &str) -> Result<String, AiError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hung_generator_times_out() {
        let analyst = AiRiskAnalyst::new(Arc::new(Hung)).with_timeout(Duration::from_millis(20));
        let assessment = analyst.assess(&txn(), &[], &[]).await;
        assert_eq!(assessment.flags, vec![TECHNICAL_ERROR_FLAG]);
    }

    #[test]
    fn test_prompt_embeds_context() {
        let tenant = TenantId::generate();
        let history: Vec<ScoredTransaction> = (0..15)
            .map(|i| ScoredTransaction {
                id: Uuid::new_v4(),
                tenant_id: tenant,
                transaction_ref: format!("old-{}", i),
                amount: 100 + i,
                currency: "EUR".into(),
                transaction_type: "payment".into(),
                user_id: Some("user-7".into()),
                merchant: None,
                device: None,
                location: None,
                risk_score: 10,
                flagged: false,
                flags: vec![],
                ai_processed: true,
                created_at: Utc::now(),
            })
            .collect();

        let prompt = build_prompt(&txn(), &history, &[]);
        assert!(prompt.contains("tx-42"));
        assert!(prompt.contains("12500 EUR"));
        assert!(prompt.contains("Acme"));
        assert_eq!(prompt.matches("| payment | risk 10").count(), HISTORY_LIMIT);
        assert!(prompt.contains("Active fraud patterns:\n- none"));
    }
}
