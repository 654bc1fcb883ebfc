//! Schema bootstrap

use tracing::info;

use crate::{DbPool, Result};

/// Apply an idempotent DDL script (`CREATE TABLE IF NOT EXISTS ...`).
pub async fn apply_schema(pool: &DbPool, name: &str, sql: &str) -> Result<()> {
    let client = pool.get().await?;
    client.batch_execute(sql).await?;
    info!(schema = name, "Schema applied");
    Ok(())
}
