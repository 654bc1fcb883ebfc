//! Opsdesk database access
//!
//! PostgreSQL connection pooling and schema bootstrap shared by the
//! microservices.

mod error;
mod pool;
mod schema;

pub use error::{DbError, Result};
pub use pool::{DbPool, PoolConfig, PoolStats};
pub use schema::apply_schema;

/// Re-export tokio-postgres types for convenience
pub use tokio_postgres::{types::ToSql, Row};
