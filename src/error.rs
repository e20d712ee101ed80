//! Error types for cap-collector

use thiserror::Error;

/// Main error type for cap-collector
#[derive(Debug, Error)]
pub enum Error {
    /// Transient upstream fetch failures (network error or non-2xx);
    /// the next scheduled pass retries.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream body did not match the expected report shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Internal accounting assertion tripped; the pass is aborted
    /// without writing.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Migration errors
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Reqwest HTTP client errors
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for cap-collector operations
pub type Result<T> = std::result::Result<T, Error>;
