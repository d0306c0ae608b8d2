//! Data models for the MLS sync engine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enums
// ============================================================================

/// Entity type fetched from a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Listing,
    Agent,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Listing => "listing",
            RecordKind::Agent => "agent",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync mode requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Page through the entire dataset and archive listings absent upstream
    Full,
    /// Fetch records modified at or after the stored watermark
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" | "incr" => Ok(SyncMode::Incremental),
            _ => Err(format!(
                "Invalid sync mode: {}. Use 'full' or 'incremental'",
                s
            )),
        }
    }
}

/// Lifecycle state of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    InProgress,
    Success,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::InProgress => "in_progress",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncRunStatus::InProgress)
    }
}

impl fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "in_progress" | "running" => Ok(SyncRunStatus::InProgress),
            "success" => Ok(SyncRunStatus::Success),
            "failed" => Ok(SyncRunStatus::Failed),
            _ => Err(format!(
                "Invalid run status: {}. Use 'in_progress', 'success' or 'failed'",
                s
            )),
        }
    }
}

/// Why a listing left the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    /// A full sync no longer reported it
    MissingUpstream,
    /// Cleanup found a terminal provider status
    TerminalStatus,
    /// Cleanup found it unmodified past the retention window
    Retention,
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::MissingUpstream => "missing_upstream",
            ArchiveReason::TerminalStatus => "terminal_status",
            ArchiveReason::Retention => "retention",
        }
    }
}

impl fmt::Display for ArchiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_upstream" => Ok(ArchiveReason::MissingUpstream),
            "terminal_status" => Ok(ArchiveReason::TerminalStatus),
            "retention" => Ok(ArchiveReason::Retention),
            _ => Err(format!("Invalid archive reason: {}", s)),
        }
    }
}

// ============================================================================
// Listing / Agent
// ============================================================================

/// Records that reconcile by a provider key and a modification timestamp
pub trait Keyed {
    fn key(&self) -> &str;
    fn modification_timestamp(&self) -> Option<DateTime<Utc>>;
}

/// A normalized MLS listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Provider-assigned key, globally unique and immutable
    pub listing_key: String,
    /// Source (MLS feed) the listing was fetched from
    pub source: String,
    pub list_price: Option<f64>,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub unit_number: Option<String>,
    pub unparsed_address: Option<String>,
    pub city: Option<String>,
    pub state_or_province: Option<String>,
    pub postal_code: Option<String>,
    /// Provider status, e.g. "Active", "Pending", "Active Under Contract"
    pub standard_status: Option<String>,
    /// Member key of the listing agent; may dangle
    pub list_agent_key: Option<String>,
    pub modification_timestamp: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub archive_reason: Option<ArchiveReason>,
    /// Full provider payload
    pub raw_fields: serde_json::Value,
}

impl Keyed for Listing {
    fn key(&self) -> &str {
        &self.listing_key
    }

    fn modification_timestamp(&self) -> Option<DateTime<Utc>> {
        self.modification_timestamp
    }
}

/// A normalized MLS member (agent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Provider-assigned member key
    pub member_key: String,
    pub source: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub office_name: Option<String>,
    pub modification_timestamp: Option<DateTime<Utc>>,
    pub raw_fields: serde_json::Value,
}

impl Keyed for Agent {
    fn key(&self) -> &str {
        &self.member_key
    }

    fn modification_timestamp(&self) -> Option<DateTime<Utc>> {
        self.modification_timestamp
    }
}

// ============================================================================
// Sync runs and results
// ============================================================================

/// Per-entity counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    /// Raw records received from the provider
    pub processed: u32,
    /// Records written (created or updated)
    pub upserted: u32,
    /// Records skipped by the timestamp guard
    pub stale: u32,
    /// Records rejected by the normalizer
    pub malformed: u32,
}

/// Counters accumulated over one sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub listings: EntityCounts,
    pub agents: EntityCounts,
    /// Listings archived because a full fetch no longer reported them
    pub archived: u32,
    /// Listings stored with an agent key that could not be resolved
    pub unresolved_links: u32,
    /// Agents fetched on demand by the linker
    pub agents_resolved: u32,
}

impl SyncCounts {
    pub fn malformed(&self) -> u32 {
        self.listings.malformed + self.agents.malformed
    }
}

/// Persisted history record of one sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub source: String,
    pub mode: SyncMode,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counts: SyncCounts,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// Outcome of `sync_source`; always returned, never thrown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub source: String,
    pub mode: SyncMode,
    /// History record id, absent when no run was started
    pub run_id: Option<String>,
    pub success: bool,
    /// True when another run already held the source
    pub skipped: bool,
    pub counts: SyncCounts,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

impl SyncResult {
    pub fn succeeded(run: &SyncRun) -> Self {
        Self {
            source: run.source.clone(),
            mode: run.mode,
            run_id: Some(run.id.clone()),
            success: true,
            skipped: false,
            counts: run.counts,
            error_kind: None,
            error: None,
            duration_ms: run.duration_ms,
        }
    }

    pub fn failed(
        source: &str,
        mode: SyncMode,
        run_id: Option<String>,
        counts: SyncCounts,
        error_kind: &str,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source: source.to_string(),
            mode,
            run_id,
            success: false,
            skipped: false,
            counts,
            error_kind: Some(error_kind.to_string()),
            error: Some(error.into()),
            duration_ms: None,
        }
    }

    pub fn skipped(source: &str, mode: SyncMode, reason: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            mode,
            run_id: None,
            success: false,
            skipped: true,
            counts: SyncCounts::default(),
            error_kind: Some("concurrent_run".to_string()),
            error: Some(reason.into()),
            duration_ms: None,
        }
    }

    /// Success or a non-fatal skip
    pub fn is_ok(&self) -> bool {
        self.success || self.skipped
    }
}

/// Outcome of `sync_all`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAllResult {
    pub mode: SyncMode,
    pub success: bool,
    pub results: Vec<SyncResult>,
}

impl SyncAllResult {
    pub fn from_results(mode: SyncMode, results: Vec<SyncResult>) -> Self {
        let success = results.iter().all(SyncResult::is_ok);
        Self {
            mode,
            success,
            results,
        }
    }
}

/// Current-status snapshot for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub source: String,
    pub latest_run: Option<SyncRun>,
    pub in_progress: bool,
    pub active_listings: i64,
    pub archived_listings: i64,
    pub agents: i64,
}

/// History query filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub status: Option<SyncRunStatus>,
    pub mode: Option<SyncMode>,
}

/// Paginated response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub pages: i64,
}

/// Result of a dangling-link repair pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRepairReport {
    pub checked: u32,
    pub resolved: u32,
    pub unresolved: u32,
}

// ============================================================================
// Cleanup
// ============================================================================

/// Cleanup schedule for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupSchedule {
    pub source: String,
    /// Cron expression with a seconds field, e.g. "0 0 3 * * *"
    pub cron_expression: String,
    pub enabled: bool,
    /// Listings not modified within this many days are archived
    pub retention_days: u32,
    /// Provider statuses that archive a listing immediately
    pub terminal_statuses: Vec<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Default cleanup cadence: daily at 03:00 UTC
pub const DEFAULT_CLEANUP_CRON: &str = "0 0 3 * * *";

/// Default retention window in days
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Default terminal provider statuses
pub const DEFAULT_TERMINAL_STATUSES: &[&str] = &["Closed", "Withdrawn", "Expired", "Canceled"];

impl CleanupSchedule {
    pub fn default_for(source: &str) -> Self {
        Self {
            source: source.to_string(),
            cron_expression: DEFAULT_CLEANUP_CRON.to_string(),
            enabled: true,
            retention_days: DEFAULT_RETENTION_DAYS,
            terminal_statuses: DEFAULT_TERMINAL_STATUSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            last_run_at: None,
            updated_at: None,
        }
    }
}

/// Result of one cleanup pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub source: String,
    /// Listings archived for a terminal status
    pub terminal_archived: u64,
    /// Listings archived for falling outside the retention window
    pub stale_archived: u64,
    pub ran_at: DateTime<Utc>,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.terminal_archived + self.stale_archived
    }
}

// ============================================================================
// Sources
// ============================================================================

/// A configured MLS source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceConfig {
    /// Unique source name, used as the sync key
    pub name: String,
    /// Provider implementation, e.g. "reso"
    pub kind: String,
    pub base_url: String,
    pub access_token: Option<String>,
    pub enabled: bool,
    pub created_at: String,
}
