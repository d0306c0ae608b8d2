//! Provider client abstraction
//!
//! A provider client fetches raw listing and agent records from an external
//! MLS feed. It hides transport and authentication, never touches local
//! state, and reports transport and credential failures distinctly so the
//! orchestrator can retry the former and stop on the latter.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ SyncOrchestrator                                    │
//! │   provider = registry.get(source)                   │
//! │   provider.fetch_changes(kind, watermark, ..)       │
//! └─────────────────────────────────────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ trait ProviderClient                                │
//! │   fn source_name() -> &str                          │
//! │   fn fetch_changes() -> Page                        │
//! │   fn fetch_one() -> Option<RawRecord>               │
//! └─────────────────────────────────────────────────────┘
//!          │
//!          ▼
//!     ┌─────────┐
//!     │  RESO   │
//!     │ Web API │
//!     └─────────┘
//! ```
//!
//! # Adding a New Provider
//!
//! 1. Create a new module (e.g., `bridge.rs`)
//! 2. Implement the `ProviderClient` trait
//! 3. Add its `kind` to `build_provider` in `registry.rs`

pub mod registry;
pub mod reso;

pub use registry::{build_provider, ProviderRegistry};
pub use reso::ResoClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::RecordKind;

/// Untyped provider record, as delivered on the wire
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// One page of provider records
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Opaque cursor for the next page; `None` on the last page
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn new(records: Vec<RawRecord>, next_cursor: Option<String>) -> Self {
        Self {
            records,
            next_cursor,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when talking to a provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network failure or timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials rejected; needs operator action
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Provider answered with a non-success status
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body could not be understood
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Whether a page fetch that failed this way may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            ProviderError::Auth(_) | ProviderError::Parse(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transport(_) => "transport",
            ProviderError::Auth(_) => "auth",
            ProviderError::Api { .. } => "api",
            ProviderError::Parse(_) => "parse",
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.chars().take(200).collect();
        match status {
            401 => ProviderError::Auth("Invalid or expired credentials".to_string()),
            403 => ProviderError::Auth("Access forbidden".to_string()),
            _ => ProviderError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Transport("Request timed out".to_string())
        } else if err.is_connect() {
            ProviderError::Transport("Connection failed".to_string())
        } else if err.is_decode() {
            ProviderError::Parse(err.to_string())
        } else if err.is_status() {
            match err.status() {
                Some(status) => ProviderError::from_status(status.as_u16(), &err.to_string()),
                None => ProviderError::Transport(err.to_string()),
            }
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Parse(err.to_string())
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Trait for MLS data providers
///
/// One implementation per provider protocol; instances are bound to a named
/// source and selected through the `ProviderRegistry`.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Source name this client is bound to (e.g., "mred")
    fn source_name(&self) -> &str;

    /// Human-readable display name
    fn display_name(&self) -> &str {
        self.source_name()
    }

    /// Fetch one page of records of `kind`
    ///
    /// `watermark = None` pages through the whole dataset; otherwise only
    /// records modified at or after the watermark are returned. Pass the
    /// previous page's `next_cursor` to continue.
    async fn fetch_changes(
        &self,
        kind: RecordKind,
        watermark: Option<DateTime<Utc>>,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Page, ProviderError>;

    /// Fetch a single record by key; `Ok(None)` when the provider has no such record
    async fn fetch_one(&self, kind: RecordKind, key: &str)
        -> Result<Option<RawRecord>, ProviderError>;
}
