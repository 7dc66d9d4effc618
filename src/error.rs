use std::time::Duration;

use thiserror::Error;

/// Error taxonomy shared by the performance components.
#[derive(Debug, Error)]
pub enum PerfError {
    /// The database could not be reached. Fatal during startup, retryable afterwards.
    #[error("connection error: {0}")]
    Connection(String),

    /// The external cache failed. Callers treat this as a miss and carry on.
    #[error("cache error: {0}")]
    Cache(String),

    #[error("query execution failed: {message}")]
    QueryExecution { sql: String, message: String },

    /// A migration was rejected before any statement ran.
    #[error("migration rejected: {0}")]
    Validation(String),

    /// A phase of a multi-phase migration failed; earlier phases stay applied.
    #[error(
        "migration `{migration}` failed at phase {phase_index} ({phase_name}) after {completed} completed phase(s): {message}; run the rollback script manually"
    )]
    PartialMigration {
        migration: String,
        phase_index: usize,
        phase_name: String,
        completed: usize,
        message: String,
    },

    #[error("{operation} cancelled after {completed_steps} completed step(s)")]
    Cancelled {
        operation: String,
        completed_steps: usize,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PerfError {
    pub fn query(sql: &str, err: impl std::fmt::Display) -> Self {
        PerfError::QueryExecution {
            sql: sql.to_string(),
            message: err.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        PerfError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Errors that should abort process startup rather than be logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PerfError::Connection(_) | PerfError::Config(_))
    }
}

impl From<redis::RedisError> for PerfError {
    fn from(err: redis::RedisError) -> Self {
        PerfError::Cache(err.to_string())
    }
}

/// Run `fut` under a deadline, mapping expiry onto [`PerfError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, PerfError>
where
    F: std::future::Future<Output = Result<T, PerfError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PerfError::timeout(operation, limit)),
    }
}
