//! Error types for Opsdesk services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpsdeskError>;

/// Failures of the service shell: configuration and the listener
#[derive(Error, Debug)]
pub enum OpsdeskError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}
