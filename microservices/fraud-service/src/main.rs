//! Fraud Service Microservice
//!
//! Transaction risk scoring for multi-tenant payment platforms:
//! - Tenant-defined velocity, geographic, behavioral and device patterns
//! - AI risk analysis with rule-weighted fallback
//! - Automatic escalation of high-risk transactions to fraud cases
//! - Case management, statistics and per-tenant scoring policy

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use opsdesk_core::{
    DependencyStatus, HealthStatus, MicroserviceRuntime, OpsdeskService, ReadinessStatus,
};
use opsdesk_db::{apply_schema, DbPool, PoolConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};

use fraud_service::ai_client::{DisabledGenerator, TextGenerationClient, TextGenerator};
use fraud_service::config::{StoreBackend, SERVICE_NAME};
use fraud_service::rate_limit::{MemoryRateLimitStore, PgRateLimitStore, RateLimitStore};
use fraud_service::store::{FraudStore, MemoryStore, PgStore, SCHEMA};
use fraud_service::{create_router, AppState, FraudConfig};

struct FraudService {
    state: AppState,
    db: Option<DbPool>,
}

#[async_trait]
impl OpsdeskService for FraudService {
    fn service_id(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.state.started_at.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let store_ok = self.state.store.is_healthy().await;
        ReadinessStatus {
            ready: store_ok,
            dependencies: vec![DependencyStatus {
                name: self.state.store.backend_name().to_string(),
                available: store_ok,
                latency_ms: None,
            }],
        }
    }

    async fn shutdown(&self) -> opsdesk_core::Result<()> {
        if let Some(db) = &self.db {
            let stats = db.stats();
            info!(
                size = stats.size,
                available = stats.available,
                waiting = stats.waiting,
                "Releasing database pool"
            );
        }
        let snapshot = self.state.metrics.snapshot();
        info!(
            transactions_scored = snapshot.transactions_scored,
            cases_escalated = snapshot.cases_escalated,
            "Fraud service shutting down"
        );
        Ok(())
    }

    async fn start(&self) -> opsdesk_core::Result<()> {
        let bind_addr = &self.state.config.service.http_bind;
        let listener = TcpListener::bind(bind_addr).await?;
        info!("Fraud service listening on {}", bind_addr);

        axum::serve(listener, create_router(self.state.clone())).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    opsdesk_telemetry::init(SERVICE_NAME)?;

    info!("Starting Fraud Service microservice");

    let config = FraudConfig::from_env()?;

    let db = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = DbPool::new(&PoolConfig::new(
                config.service.database_url.clone(),
                config.db_pool_size,
            ))?;
            apply_schema(&pool, "fraud", SCHEMA)
                .await
                .context("applying fraud schema")?;
            Some(pool)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; data is lost on restart");
            None
        }
    };

    let store: Arc<dyn FraudStore> = match &db {
        Some(pool) => Arc::new(PgStore::new(pool.clone())),
        None => Arc::new(MemoryStore::new()),
    };

    let rate_store: Arc<dyn RateLimitStore> = match (config.rate_limit.backend, &db) {
        (StoreBackend::Postgres, Some(pool)) => Arc::new(PgRateLimitStore::new(pool.clone())),
        (StoreBackend::Postgres, None) => {
            warn!("Postgres rate limiting needs the postgres store; using in-memory buckets");
            Arc::new(MemoryRateLimitStore::new())
        }
        (StoreBackend::Memory, _) => Arc::new(MemoryRateLimitStore::new()),
    };

    let generator: Arc<dyn TextGenerator> = if config.ai.enabled() {
        Arc::new(TextGenerationClient::new(&config.ai)?)
    } else {
        warn!("AI_API_KEY not set; every analysis uses the fallback assessment");
        Arc::new(DisabledGenerator)
    };

    let state = AppState::new(config, store, generator, rate_store);
    let service = Arc::new(FraudService { state, db });

    MicroserviceRuntime::run(service).await?;
    Ok(())
}
