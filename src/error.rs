//! Error types for the code actions service.

use thiserror::Error;

use crate::coderun::CodeRunStatus;
use crate::workerpool::PoolError;

/// Service errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request rejected before any I/O happened.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced record does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Admission denied by the rate limiter; no run was created.
    #[error("Rate limit exceeded for code {0}")]
    RateLimited(String),

    /// Worker pool refused or dropped the task.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A run was asked to move backwards or skip a state.
    #[error("Invalid code run transition from {from} to {to}")]
    InvalidTransition {
        from: CodeRunStatus,
        to: CodeRunStatus,
    },

    /// Caller stopped waiting for the run result.
    #[error("Timed out waiting for code run {0}")]
    Timeout(String),

    /// PostgreSQL operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed at startup.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// MongoDB operation failed.
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Object storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// Result type using the service Error.
pub type Result<T> = std::result::Result<T, Error>;
