//! Configuration for Fraud Service

use opsdesk_core::config::{parse_bool, parse_var};
use opsdesk_core::{OpsdeskError, Result, ServiceConfig};
use std::time::Duration;

/// Where fraud data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Text-generation endpoint settings
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_url: String,
    /// Empty disables the AI analyst; every analysis takes the fallback.
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl AiConfig {
    pub fn enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key: String::new(),
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u64,
    pub window: Duration,
    pub backend: StoreBackend,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 600,
            window: Duration::from_secs(60),
            backend: StoreBackend::Memory,
        }
    }
}

/// Fraud Service configuration
#[derive(Debug, Clone)]
pub struct FraudConfig {
    pub service: ServiceConfig,
    pub db_pool_size: usize,
    pub store_backend: StoreBackend,
    pub jwt_secret: String,
    pub ai: AiConfig,
    pub rate_limit: RateLimitConfig,
    /// Serialize scoring per (tenant, user) so velocity counts see prior writes
    pub serialize_user_scoring: bool,
    /// Reject case status changes outside the review workflow
    pub enforce_case_transitions: bool,
    pub default_list_limit: usize,
}

/// Hard cap on any list endpoint
pub const MAX_LIST_LIMIT: usize = 200;

pub const SERVICE_NAME: &str = "fraud-service";

const DEV_JWT_SECRET: &str = "opsdesk-dev-secret";

impl FraudConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut service = ServiceConfig::from_env()?;
        if std::env::var("SERVICE_NAME").is_err() {
            service.service_name = SERVICE_NAME.to_string();
        }
        let store_backend: StoreBackend = parse_var("STORE_BACKEND", StoreBackend::Postgres)?;

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ if store_backend == StoreBackend::Memory => DEV_JWT_SECRET.to_string(),
            _ => {
                return Err(OpsdeskError::Config(
                    "JWT_SECRET must be set when using the postgres backend".to_string(),
                ))
            }
        };

        let defaults = AiConfig::default();
        let ai = AiConfig {
            api_url: std::env::var("AI_API_URL").unwrap_or(defaults.api_url),
            api_key: std::env::var("AI_API_KEY").unwrap_or_default(),
            model: std::env::var("AI_MODEL").unwrap_or(defaults.model),
            max_tokens: parse_var("AI_MAX_TOKENS", defaults.max_tokens)?,
            timeout: Duration::from_secs(parse_var("AI_TIMEOUT_SECS", 30u64)?),
        };

        let rate_limit = RateLimitConfig {
            requests_per_window: parse_var("RATE_LIMIT_PER_WINDOW", 600u64)?,
            window: Duration::from_secs(parse_var("RATE_LIMIT_WINDOW_SECS", 60u64)?.max(1)),
            backend: parse_var("RATE_LIMIT_BACKEND", StoreBackend::Memory)?,
        };

        Ok(Self {
            service,
            db_pool_size: parse_var("DB_POOL_SIZE", 16usize)?,
            store_backend,
            jwt_secret,
            ai,
            rate_limit,
            serialize_user_scoring: parse_bool("SERIALIZE_USER_SCORING", true)?,
            enforce_case_transitions: parse_bool("ENFORCE_CASE_TRANSITIONS", false)?,
            default_list_limit: parse_var("CASE_LIST_LIMIT", 50usize)?.clamp(1, MAX_LIST_LIMIT),
        })
    }

    /// In-memory configuration used by tests and local runs
    pub fn in_memory(jwt_secret: &str) -> Self {
        Self {
            service: ServiceConfig {
                service_name: SERVICE_NAME.to_string(),
                http_bind: "127.0.0.1:0".to_string(),
                database_url: String::new(),
                log_level: "info".to_string(),
                json_logs: false,
            },
            db_pool_size: 1,
            store_backend: StoreBackend::Memory,
            jwt_secret: jwt_secret.to_string(),
            ai: AiConfig::default(),
            rate_limit: RateLimitConfig::default(),
            serialize_user_scoring: true,
            enforce_case_transitions: false,
            default_list_limit: 50,
        }
    }

    /// Clamp a caller-supplied page size
    pub fn list_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_list_limit)
            .clamp(1, MAX_LIST_LIMIT)
    }
}
