//! Fraud domain model
//!
//! Patterns, scored transactions, cases, and the per-tenant scoring policy.
//! Every entity carries its owning tenant; stores filter on it for every read.

use chrono::{DateTime, Utc};
use opsdesk_core::TenantId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Detection rule family. Decides which evaluator branch scores a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Velocity,
    Geographic,
    Behavioral,
    Device,
    /// Anything else found in storage; always scores 0
    #[serde(other)]
    Unknown,
}

impl PatternType {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "velocity" => Self::Velocity,
            "geographic" => Self::Geographic,
            "behavioral" => Self::Behavioral,
            "device" => Self::Device,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Velocity => "velocity",
            Self::Geographic => "geographic",
            Self::Behavioral => "behavioral",
            Self::Device => "device",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Tenant-configured detection rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudPattern {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub pattern_type: PatternType,
    pub detection_rules: Value,
    pub thresholds: Value,
    pub is_active: bool,
    pub match_count: i64,
    pub last_matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_known_type(pattern_type: &PatternType) -> Result<(), ValidationError> {
    if pattern_type.is_known() {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_pattern_type"))
    }
}

fn validate_object(value: &Value) -> Result<(), ValidationError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(ValidationError::new("expected_object"))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePatternRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(custom(function = "validate_known_type"))]
    pub pattern_type: PatternType,
    #[validate(custom(function = "validate_object"))]
    pub detection_rules: Option<Value>,
    #[validate(custom(function = "validate_object"))]
    pub thresholds: Option<Value>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePatternRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[validate(custom(function = "validate_known_type"))]
    pub pattern_type: Option<PatternType>,
    #[validate(custom(function = "validate_object"))]
    pub detection_rules: Option<Value>,
    #[validate(custom(function = "validate_object"))]
    pub thresholds: Option<Value>,
    pub is_active: Option<bool>,
}

impl FraudPattern {
    pub fn from_request(tenant_id: TenantId, req: CreatePatternRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: req.name,
            pattern_type: req.pattern_type,
            detection_rules: req.detection_rules.unwrap_or_else(empty_object),
            thresholds: req.thresholds.unwrap_or_else(empty_object),
            is_active: req.is_active.unwrap_or(true),
            match_count: 0,
            last_matched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_update(&mut self, req: UpdatePatternRequest) {
        if let Some(name) = req.name {
            self.name = name;
        }
        if let Some(pattern_type) = req.pattern_type {
            self.pattern_type = pattern_type;
        }
        if let Some(rules) = req.detection_rules {
            self.detection_rules = rules;
        }
        if let Some(thresholds) = req.thresholds {
            self.thresholds = thresholds;
        }
        if let Some(active) = req.is_active {
            self.is_active = active;
        }
        self.updated_at = Utc::now();
    }
}

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Incoming transaction to score
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeTransactionRequest {
    /// External reference supplied by the caller
    #[serde(alias = "id")]
    #[validate(length(min = 1, max = 128))]
    pub transaction_id: String,
    /// Minor units
    #[validate(range(min = 0))]
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(default = "default_transaction_type")]
    #[validate(length(min = 1, max = 64))]
    pub transaction_type: String,
    pub user_id: Option<String>,
    pub merchant: Option<Value>,
    pub device: Option<Value>,
    pub location: Option<Value>,
}

fn default_transaction_type() -> String {
    "payment".to_string()
}

/// A transaction after scoring. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredTransaction {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub transaction_ref: String,
    pub amount: i64,
    pub currency: String,
    pub transaction_type: String,
    pub user_id: Option<String>,
    pub merchant: Option<Value>,
    pub device: Option<Value>,
    pub location: Option<Value>,
    pub risk_score: i32,
    pub flagged: bool,
    pub flags: Vec<String>,
    pub ai_processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Narrative produced by the AI analyst
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    pub summary: String,
    pub reasoning: String,
    pub recommendations: Vec<String>,
    pub patterns: Vec<String>,
}

/// One pattern's contribution to a score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternMatch {
    pub pattern_id: Uuid,
    pub pattern_name: String,
    pub pattern_type: PatternType,
    pub confidence: u8,
    pub details: Value,
}

/// Review status of a fraud case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Investigating,
    Resolved,
    FalsePositive,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
            Self::FalsePositive => "false_positive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "investigating" => Some(Self::Investigating),
            "resolved" => Some(Self::Resolved),
            "false_positive" => Some(Self::FalsePositive),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Resolved | Self::FalsePositive)
    }

    /// Review workflow allow-list. Only consulted when transition
    /// enforcement is switched on.
    pub fn can_transition_to(&self, next: CaseStatus) -> bool {
        use CaseStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Pending, Investigating)
                    | (Pending, FalsePositive)
                    | (Investigating, Resolved)
                    | (Investigating, FalsePositive)
            )
    }
}

impl Default for CaseStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Which inputs produced a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Manual,
    RuleBased,
    AiPattern,
    Hybrid,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::RuleBased => "rule_based",
            Self::AiPattern => "ai_pattern",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(Self::Manual),
            "rule_based" => Some(Self::RuleBased),
            "ai_pattern" => Some(Self::AiPattern),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// Human-reviewable escalation. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudCase {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub transaction_ref: String,
    pub amount: i64,
    pub currency: String,
    pub risk_score: i32,
    pub status: CaseStatus,
    pub flags: Vec<String>,
    pub assigned_to: Option<String>,
    pub notes: Option<String>,
    pub ai_analysis: Option<AiAnalysis>,
    pub detection_method: DetectionMethod,
    pub pattern_matches: Vec<PatternMatch>,
    pub anomaly_score: Option<i32>,
    pub confidence_level: Option<i32>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaseRequest {
    #[serde(alias = "transactionRef")]
    #[validate(length(min = 1, max = 128))]
    pub transaction_id: String,
    #[validate(range(min = 0))]
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(range(min = 0, max = 100))]
    pub risk_score: i32,
    pub status: Option<CaseStatus>,
    #[validate(length(max = 10000))]
    pub notes: Option<String>,
    pub flags: Option<Vec<String>>,
    #[validate(length(min = 1, max = 128))]
    pub assigned_to: Option<String>,
}

/// Partial update; absent fields are left untouched
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCaseRequest {
    pub status: Option<CaseStatus>,
    #[validate(length(max = 10000))]
    pub notes: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub assigned_to: Option<String>,
}

impl UpdateCaseRequest {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.notes.is_none() && self.assigned_to.is_none()
    }
}

/// Per-tenant aggregation weights and escalation threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringPolicy {
    pub escalation_threshold: u8,
    pub ai_weight: f64,
    pub rule_weight: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            escalation_threshold: 70,
            ai_weight: 0.7,
            rule_weight: 0.3,
        }
    }
}

impl ScoringPolicy {
    const WEIGHT_TOLERANCE: f64 = 1e-6;

    pub fn validate(&self) -> Result<(), String> {
        if self.escalation_threshold > 100 {
            return Err("escalationThreshold must be within 0..=100".to_string());
        }
        for (name, weight) in [("aiWeight", self.ai_weight), ("ruleWeight", self.rule_weight)] {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(format!("{} must be within 0..=1", name));
            }
        }
        if (self.ai_weight + self.rule_weight - 1.0).abs() > Self::WEIGHT_TOLERANCE {
            return Err("aiWeight and ruleWeight must sum to 1".to_string());
        }
        Ok(())
    }

    /// Strictly above the threshold escalates
    pub fn should_escalate(&self, risk_score: u8) -> bool {
        risk_score > self.escalation_threshold
    }
}
