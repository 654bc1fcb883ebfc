//! Rule evaluator
//!
//! Scores one transaction against one pattern definition. Evaluation never
//! fails: missing context, malformed parameters, unknown pattern types and
//! ledger hiccups all score 0.

use chrono::{DateTime, Duration, Utc};
use opsdesk_core::TenantId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::domain::{AnalyzeTransactionRequest, FraudPattern, PatternType};
use crate::store::TransactionLedger;

/// Sub-score for one pattern
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub score: u8,
    pub details: Value,
}

impl RuleOutcome {
    fn none() -> Self {
        Self {
            score: 0,
            details: Value::Null,
        }
    }

    pub fn matched(&self) -> bool {
        self.score > 0
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct VelocityRules {
    time_window_minutes: i64,
}

impl Default for VelocityRules {
    fn default() -> Self {
        Self {
            time_window_minutes: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct VelocityThresholds {
    max_transactions: u32,
}

impl Default for VelocityThresholds {
    fn default() -> Self {
        Self { max_transactions: 5 }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GeographicRules {
    restricted_countries: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GeographicThresholds {
    restricted_country_score: f64,
}

impl Default for GeographicThresholds {
    fn default() -> Self {
        Self {
            restricted_country_score: 80.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BehavioralRules {
    lookback_days: i64,
}

impl Default for BehavioralRules {
    fn default() -> Self {
        Self { lookback_days: 30 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BehavioralThresholds {
    max_deviation: f64,
}

impl Default for BehavioralThresholds {
    fn default() -> Self {
        Self { max_deviation: 3.0 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeviceThresholds {
    suspicious_device_score: f64,
}

impl Default for DeviceThresholds {
    fn default() -> Self {
        Self {
            suspicious_device_score: 60.0,
        }
    }
}

/// Velocity windows are capped at one year
const MAX_WINDOW_MINUTES: i64 = 525_600;

/// Behavioral lookback is capped at ten years
const MAX_LOOKBACK_DAYS: i64 = 3_650;

/// Device flags that count as suspicious, camelCase first
const DEVICE_SIGNALS: [(&str, &str); 4] = [
    ("isEmulator", "is_emulator"),
    ("isRooted", "is_rooted"),
    ("vpnDetected", "vpn_detected"),
    ("proxyDetected", "proxy_detected"),
];

/// Read a parameter map, falling back to defaults when it is malformed
fn params<T: DeserializeOwned + Default>(pattern: &FraudPattern, value: &Value) -> T {
    if value.is_null() {
        return T::default();
    }
    match T::deserialize(value) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                pattern_id = %pattern.id,
                pattern = %pattern.name,
                error = %e,
                "Malformed pattern parameters, using defaults"
            );
            T::default()
        }
    }
}

/// Configured fixed score, clamped to 0..=100
fn fixed_score(configured: f64) -> u8 {
    configured.round().clamp(0.0, 100.0) as u8
}

/// Start of a lookback window, or `None` when it falls outside the calendar
fn window_start(now: DateTime<Utc>, window: Option<Duration>) -> Option<DateTime<Utc>> {
    window.and_then(|w| now.checked_sub_signed(w))
}

/// Percentage of `value / limit`, clamped to 0..=100
fn ratio_score(value: f64, limit: f64) -> u8 {
    if !value.is_finite() || limit <= 0.0 {
        return 100;
    }
    (value / limit * 100.0).round().clamp(0.0, 100.0) as u8
}

pub struct RuleEvaluator<'a, L: TransactionLedger + ?Sized> {
    ledger: &'a L,
}

impl<'a, L: TransactionLedger + ?Sized> RuleEvaluator<'a, L> {
    pub fn new(ledger: &'a L) -> Self {
        Self { ledger }
    }

    pub async fn evaluate(
        &self,
        tenant: TenantId,
        txn: &AnalyzeTransactionRequest,
        pattern: &FraudPattern,
        now: DateTime<Utc>,
    ) -> RuleOutcome {
        match pattern.pattern_type {
            PatternType::Velocity => self.velocity(tenant, txn, pattern, now).await,
            PatternType::Geographic => Self::geographic(txn, pattern),
            PatternType::Behavioral => self.behavioral(tenant, txn, pattern, now).await,
            PatternType::Device => Self::device(txn, pattern),
            PatternType::Unknown => RuleOutcome::none(),
        }
    }

    async fn velocity(
        &self,
        tenant: TenantId,
        txn: &AnalyzeTransactionRequest,
        pattern: &FraudPattern,
        now: DateTime<Utc>,
    ) -> RuleOutcome {
        let Some(user_id) = txn.user_id.as_deref() else {
            return RuleOutcome::none();
        };
        let rules: VelocityRules = params(pattern, &pattern.detection_rules);
        let thresholds: VelocityThresholds = params(pattern, &pattern.thresholds);

        let window_minutes = rules.time_window_minutes.clamp(1, MAX_WINDOW_MINUTES);
        let Some(since) = window_start(now, Duration::try_minutes(window_minutes)) else {
            warn!(pattern_id = %pattern.id, window_minutes, "Velocity window out of range");
            return RuleOutcome::none();
        };
        let count = match self.ledger.count_user_transactions_since(tenant, user_id, since).await {
            Ok(count) => count,
            Err(e) => {
                warn!(pattern_id = %pattern.id, error = %e, "Velocity lookup failed");
                return RuleOutcome::none();
            }
        };

        if count <= u64::from(thresholds.max_transactions) {
            return RuleOutcome::none();
        }

        RuleOutcome {
            score: ratio_score(count as f64, f64::from(thresholds.max_transactions)),
            details: json!({
                "transactionCount": count,
                "maxTransactions": thresholds.max_transactions,
                "timeWindowMinutes": window_minutes,
            }),
        }
    }

    fn geographic(txn: &AnalyzeTransactionRequest, pattern: &FraudPattern) -> RuleOutcome {
        let Some(country) = location_country(txn.location.as_ref()) else {
            return RuleOutcome::none();
        };
        let rules: GeographicRules = params(pattern, &pattern.detection_rules);
        let thresholds: GeographicThresholds = params(pattern, &pattern.thresholds);

        let restricted = rules
            .restricted_countries
            .iter()
            .any(|c| c.trim().eq_ignore_ascii_case(&country));
        if !restricted {
            return RuleOutcome::none();
        }

        RuleOutcome {
            score: fixed_score(thresholds.restricted_country_score),
            details: json!({
                "country": country,
                "restricted": true,
            }),
        }
    }

    async fn behavioral(
        &self,
        tenant: TenantId,
        txn: &AnalyzeTransactionRequest,
        pattern: &FraudPattern,
        now: DateTime<Utc>,
    ) -> RuleOutcome {
        let Some(user_id) = txn.user_id.as_deref() else {
            return RuleOutcome::none();
        };
        let rules: BehavioralRules = params(pattern, &pattern.detection_rules);
        let thresholds: BehavioralThresholds = params(pattern, &pattern.thresholds);

        let lookback_days = rules.lookback_days.clamp(1, MAX_LOOKBACK_DAYS);
        let Some(since) = window_start(now, Duration::try_days(lookback_days)) else {
            warn!(pattern_id = %pattern.id, lookback_days, "Behavioral lookback out of range");
            return RuleOutcome::none();
        };
        let mean = match self.ledger.user_average_amount_since(tenant, user_id, since).await {
            Ok(Some(mean)) if mean > 0.0 => mean,
            Ok(_) => return RuleOutcome::none(),
            Err(e) => {
                warn!(pattern_id = %pattern.id, error = %e, "Behavioral lookup failed");
                return RuleOutcome::none();
            }
        };

        let deviation = (txn.amount as f64 - mean).abs() / mean;
        if deviation <= thresholds.max_deviation {
            return RuleOutcome::none();
        }

        RuleOutcome {
            score: ratio_score(deviation, thresholds.max_deviation),
            details: json!({
                "averageAmount": mean.round() as i64,
                "amount": txn.amount,
                "deviation": (deviation * 100.0).round() / 100.0,
                "maxDeviation": thresholds.max_deviation,
            }),
        }
    }

    fn device(txn: &AnalyzeTransactionRequest, pattern: &FraudPattern) -> RuleOutcome {
        let Some(device) = txn.device.as_ref() else {
            return RuleOutcome::none();
        };

        let signals: Vec<&str> = DEVICE_SIGNALS
            .iter()
            .filter(|(camel, snake)| {
                device
                    .get(*camel)
                    .or_else(|| device.get(*snake))
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
            .map(|(camel, _)| *camel)
            .collect();

        if signals.is_empty() {
            return RuleOutcome::none();
        }

        let thresholds: DeviceThresholds = params(pattern, &pattern.thresholds);
        RuleOutcome {
            score: fixed_score(thresholds.suspicious_device_score),
            details: json!({
                "suspiciousSignals": signals,
                "signalCount": signals.len(),
            }),
        }
    }
}

fn location_country(location: Option<&Value>) -> Option<String> {
    let location = location?;
    ["country", "countryCode", "country_code"]
        .iter()
        .find_map(|key| location.get(*key).and_then(Value::as_str))
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
}
