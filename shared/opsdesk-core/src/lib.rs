//! Opsdesk Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - Standard service trait all microservices implement
//! - Tenant-scoped identity types (TenantId, RequestContext)
//! - Error handling utilities
//! - Configuration management

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::ServiceConfig;
pub use domain::*;
pub use error::{OpsdeskError, Result};
pub use service::{DependencyStatus, HealthStatus, MicroserviceRuntime, OpsdeskService, ReadinessStatus};
