//! # mlsync-core
//!
//! MLS synchronization engine: keeps a local, deduplicated mirror of listing
//! and agent records from external MLS feeds.
//!
//! This crate provides:
//! - Database operations (`db` module)
//! - Data models (`models` module)
//! - Provider clients, reconciliation, linking, history and cleanup (`services` module)
//! - Engine settings (`config` module)
//! - Unified error handling (`error` module)

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

// Re-exports for convenience
pub use config::SyncSettings;
pub use db::Database;
pub use error::{Error, Result};

// Re-export commonly used types from models
pub use models::{
    Agent, ArchiveReason, CleanupReport, CleanupSchedule, EntityCounts, HistoryFilter, Keyed,
    LinkRepairReport, Listing, PaginatedResponse, RecordKind, SourceConfig, SyncAllResult,
    SyncCounts, SyncMode, SyncResult, SyncRun, SyncRunStatus, SyncStatusReport,
};

// Re-export commonly used types from services
pub use services::{
    AgentLinker, CleanupScheduler, LinkOutcome, MalformedRecordError, Page, ProviderClient,
    ProviderError, ProviderRegistry, RawRecord, ReconciliationEngine, RecordStore, ResoClient,
    SyncHistory, SyncOrchestrator, UpsertResult,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
