//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod cleanup;
pub mod links;
pub mod source;
pub mod sync;

use crate::output::OutputFormat;
use mlsync_core::{Database, SyncOrchestrator, SyncSettings};

/// Shared context for all commands
pub struct Context {
    pub db: Database,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Context {
    /// Orchestrator over every enabled source, with settings from the environment
    pub async fn orchestrator(&self) -> anyhow::Result<SyncOrchestrator> {
        Ok(SyncOrchestrator::from_db(&self.db, SyncSettings::from_env()).await?)
    }
}

/// Format an optional timestamp for table cells
pub fn format_time(value: Option<chrono::DateTime<chrono::Utc>>) -> String {
    value
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
