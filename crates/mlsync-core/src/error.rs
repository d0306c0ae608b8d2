//! Unified error handling for mlsync-core

use thiserror::Error;

use crate::services::provider::ProviderError;

/// Core error type for mlsync-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("A sync run is already in progress for source '{source_name}'")]
    ConcurrentRun { source_name: String },

    #[error("Full sync of '{source_name}' returned no listings; refusing to archive")]
    EmptyFullFetch { source_name: String },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for mlsync-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Short machine-readable classification, stored with failed sync runs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Provider(e) => e.kind(),
            Error::ConcurrentRun { .. } => "concurrent_run",
            Error::EmptyFullFetch { .. } => "empty_full_fetch",
            Error::Scheduler(_) => "scheduler",
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for Error {
    fn from(err: tokio_cron_scheduler::JobSchedulerError) -> Self {
        Error::Scheduler(format!("{:?}", err))
    }
}

// Convert to String for callers that render plain messages
impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}
