//! Engine settings
//!
//! Tunables for the sync orchestrator. Defaults are sensible for a single
//! MLS feed; every value can be overridden from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of records requested per page
pub const DEFAULT_PAGE_SIZE: u32 = 200;

/// Maximum page size accepted by `validate`
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Default number of attempts per page before a transport error fails the run
pub const DEFAULT_MAX_PAGE_ATTEMPTS: u32 = 3;

/// Default initial retry backoff in milliseconds (doubles per attempt)
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Default per-request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default age after which an `in_progress` run is considered orphaned
pub const DEFAULT_RECLAIM_TIMEOUT_MINUTES: u32 = 120;

/// Hard cap on pages fetched per entity in one run
pub const DEFAULT_MAX_PAGES: u32 = 10_000;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Records requested per provider page
    pub page_size: u32,
    /// Attempts per page for retryable provider errors (minimum 1)
    pub max_page_attempts: u32,
    /// Initial backoff between page attempts, doubled after each failure
    pub retry_backoff_ms: u64,
    /// Timeout applied to every provider call
    pub request_timeout_secs: u64,
    /// In-progress runs older than this are reclaimed by the next `begin`
    pub reclaim_timeout_minutes: u32,
    /// Safety cap on pages per entity per run
    pub max_pages: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_page_attempts: DEFAULT_MAX_PAGE_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            reclaim_timeout_minutes: DEFAULT_RECLAIM_TIMEOUT_MINUTES,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl SyncSettings {
    /// Build settings from defaults plus `MLSYNC_*` environment overrides
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: env_or("MLSYNC_PAGE_SIZE", defaults.page_size),
            max_page_attempts: env_or("MLSYNC_MAX_PAGE_ATTEMPTS", defaults.max_page_attempts),
            retry_backoff_ms: env_or("MLSYNC_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            request_timeout_secs: env_or(
                "MLSYNC_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            reclaim_timeout_minutes: env_or(
                "MLSYNC_RECLAIM_TIMEOUT_MINUTES",
                defaults.reclaim_timeout_minutes,
            ),
            max_pages: env_or("MLSYNC_MAX_PAGES", defaults.max_pages),
        }
        .validate()
    }

    /// Validate and normalize the settings
    pub fn validate(&self) -> Self {
        Self {
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
            max_page_attempts: self.max_page_attempts.max(1),
            retry_backoff_ms: self.retry_backoff_ms,
            request_timeout_secs: self.request_timeout_secs.max(1),
            reclaim_timeout_minutes: self.reclaim_timeout_minutes.max(1),
            max_pages: self.max_pages.max(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reclaim_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reclaim_timeout_minutes as i64)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("[config] Ignoring unparsable {}={}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
