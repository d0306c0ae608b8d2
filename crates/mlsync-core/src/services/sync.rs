//! Sync Orchestrator
//!
//! Public entry point for sync runs, called by cron jobs or manual triggers.
//! One run of a source goes:
//!
//! ```text
//! history.begin ─► agents:   fetch pages ─► normalize ─► reconcile
//!               ─► listings: fetch pages ─► normalize ─► reconcile ─► link agents
//!               ─► full mode: archive listings the fetch never reported
//!               ─► history.complete / history.fail
//! ```
//!
//! Agents go first so the linker only fetches agents the feed did not
//! deliver. `sync_source` never returns an error: every outcome, including
//! a skipped concurrent run, is a `SyncResult`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::SqlitePool;

use super::history::SyncHistory;
use super::linker::{AgentLinker, LinkOutcome};
use super::normalizer::{normalize_agent, normalize_listing};
use super::provider::{Page, ProviderClient, ProviderError, ProviderRegistry};
use super::reconcile::ReconciliationEngine;
use super::store::RecordStore;
use crate::config::SyncSettings;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    EntityCounts, HistoryFilter, LinkRepairReport, PaginatedResponse, RecordKind, SyncAllResult,
    SyncCounts, SyncMode, SyncResult, SyncRun, SyncStatusReport,
};

/// Coordinates sync runs across all registered sources
pub struct SyncOrchestrator {
    registry: ProviderRegistry,
    settings: SyncSettings,
    store: RecordStore,
    engine: ReconciliationEngine,
    history: SyncHistory,
}

impl SyncOrchestrator {
    pub fn new(pool: SqlitePool, registry: ProviderRegistry, settings: SyncSettings) -> Self {
        let settings = settings.validate();
        let store = RecordStore::new(pool.clone());
        Self {
            engine: ReconciliationEngine::new(store.clone()),
            history: SyncHistory::new(pool, settings.reclaim_timeout()),
            store,
            registry,
            settings,
        }
    }

    /// Build an orchestrator for every enabled source configured in the database
    pub async fn from_db(db: &Database, settings: SyncSettings) -> Result<Self> {
        let registry = ProviderRegistry::from_db(&db.pool, &settings).await?;
        Ok(Self::new(db.pool.clone(), registry, settings))
    }

    pub fn sources(&self) -> Vec<String> {
        self.registry.sources()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn history_recorder(&self) -> &SyncHistory {
        &self.history
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Run one source through fetch, normalize, reconcile and link
    pub async fn sync_source(&self, source: &str, mode: SyncMode) -> SyncResult {
        let provider = match self.registry.get(source) {
            Some(provider) => provider,
            None => {
                log::warn!("[sync] Unknown or disabled source '{}'", source);
                return SyncResult::failed(
                    source,
                    mode,
                    None,
                    SyncCounts::default(),
                    "not_found",
                    format!("No enabled source named '{}'", source),
                );
            }
        };

        let run = match self.history.begin(source, mode).await {
            Ok(run) => run,
            Err(e @ Error::ConcurrentRun { .. }) => {
                return SyncResult::skipped(source, mode, e.to_string());
            }
            Err(e) => {
                log::error!("[sync] Could not start run for '{}': {}", source, e);
                return SyncResult::failed(
                    source,
                    mode,
                    None,
                    SyncCounts::default(),
                    e.kind(),
                    e.to_string(),
                );
            }
        };

        log::info!("[sync] Starting {} sync of '{}' (run {})", mode, source, run.id);

        let mut counts = SyncCounts::default();
        match self.run(provider, source, mode, &mut counts).await {
            Ok(()) => match self.history.complete(&run.id, &counts).await {
                Ok(done) => {
                    log::info!(
                        "[sync] '{}' done: listings {}/{} upserted, agents {}/{} upserted, {} archived, {} unresolved link(s)",
                        source,
                        counts.listings.upserted,
                        counts.listings.processed,
                        counts.agents.upserted,
                        counts.agents.processed,
                        counts.archived,
                        counts.unresolved_links
                    );
                    SyncResult::succeeded(&done)
                }
                Err(e) => {
                    log::error!("[sync] Run {} finished but was not recorded: {}", run.id, e);
                    SyncResult::failed(source, mode, Some(run.id), counts, e.kind(), e.to_string())
                }
            },
            Err(e) => {
                log::error!("[sync] {} sync of '{}' failed: {}", mode, source, e);
                let message = e.to_string();
                let mut result =
                    SyncResult::failed(source, mode, Some(run.id.clone()), counts, e.kind(), &message);

                match self.history.fail(&run.id, &counts, e.kind(), &message).await {
                    Ok(recorded) => result.duration_ms = recorded.duration_ms,
                    Err(record_err) => log::error!(
                        "[sync] Could not record failure of run {}: {}",
                        run.id,
                        record_err
                    ),
                }
                result
            }
        }
    }

    /// Run every registered source in turn; one failure never stops the others
    pub async fn sync_all(&self, mode: SyncMode) -> SyncAllResult {
        let sources = self.registry.sources();
        log::info!("[sync] Syncing {} source(s), mode {}", sources.len(), mode);

        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            results.push(self.sync_source(&source, mode).await);
        }

        let all = SyncAllResult::from_results(mode, results);
        if !all.success {
            let failed: Vec<&str> = all
                .results
                .iter()
                .filter(|r| !r.is_ok())
                .map(|r| r.source.as_str())
                .collect();
            log::warn!("[sync] Sources with failures: {}", failed.join(", "));
        }
        all
    }

    /// Current status of a source, read fresh from the database
    pub async fn status(&self, source: &str) -> Result<SyncStatusReport> {
        let latest_run = self.history.latest(source).await?;
        let in_progress = self.history.in_progress(source).await?.is_some();

        Ok(SyncStatusReport {
            source: source.to_string(),
            latest_run,
            in_progress,
            active_listings: self.store.count_listings(source, false).await?,
            archived_listings: self.store.count_listings(source, true).await?,
            agents: self.store.count_agents(source).await?,
        })
    }

    pub async fn history(
        &self,
        source: &str,
        page: i64,
        page_size: i64,
        filter: &HistoryFilter,
    ) -> Result<PaginatedResponse<SyncRun>> {
        self.history.history(source, page, page_size, filter).await
    }

    /// Retry agent resolution for listings left with dangling agent keys
    pub async fn repair_links(&self, source: &str) -> Result<LinkRepairReport> {
        let provider = self
            .registry
            .get(source)
            .ok_or_else(|| Error::not_found(format!("No enabled source named '{}'", source)))?;

        let mut linker = AgentLinker::new(
            provider,
            self.store.clone(),
            self.settings.request_timeout(),
        );
        linker.repair_links().await
    }

    // ========================================================================
    // Run internals
    // ========================================================================

    async fn run(
        &self,
        provider: Arc<dyn ProviderClient>,
        source: &str,
        mode: SyncMode,
        counts: &mut SyncCounts,
    ) -> Result<()> {
        self.sync_agents(provider.as_ref(), source, mode, &mut counts.agents)
            .await?;

        let mut linker = AgentLinker::new(
            provider.clone(),
            self.store.clone(),
            self.settings.request_timeout(),
        );
        let seen = self
            .sync_listings(provider.as_ref(), &mut linker, source, mode, counts)
            .await?;

        counts.archived = self.engine.archive_missing(source, mode, &seen).await?;
        Ok(())
    }

    async fn watermark(&self, source: &str, kind: RecordKind, mode: SyncMode) -> Result<Option<DateTime<Utc>>> {
        match mode {
            SyncMode::Full => Ok(None),
            SyncMode::Incremental => self.store.max_modification_timestamp(source, kind).await,
        }
    }

    async fn sync_agents(
        &self,
        provider: &dyn ProviderClient,
        source: &str,
        mode: SyncMode,
        counts: &mut EntityCounts,
    ) -> Result<()> {
        let watermark = self.watermark(source, RecordKind::Agent, mode).await?;
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = self
                .next_page(provider, RecordKind::Agent, watermark, cursor.as_deref(), &mut pages)
                .await?;
            counts.processed += page.records.len() as u32;

            let mut batch = Vec::with_capacity(page.records.len());
            for raw in &page.records {
                match normalize_agent(source, raw) {
                    Ok(agent) => batch.push(agent),
                    Err(e) => {
                        log::warn!("[sync] Skipping record from '{}': {}", source, e);
                        counts.malformed += 1;
                    }
                }
            }

            let outcome = self.engine.apply_agents(batch).await?;
            counts.upserted += outcome.upserted;
            counts.stale += outcome.stale;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if mode == SyncMode::Full && counts.processed == 0 {
            log::warn!("[sync] Full agent fetch for '{}' returned no records", source);
        }
        Ok(())
    }

    /// Returns the keys of every valid listing the provider reported
    async fn sync_listings(
        &self,
        provider: &dyn ProviderClient,
        linker: &mut AgentLinker,
        source: &str,
        mode: SyncMode,
        counts: &mut SyncCounts,
    ) -> Result<HashSet<String>> {
        let watermark = self.watermark(source, RecordKind::Listing, mode).await?;
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = self
                .next_page(provider, RecordKind::Listing, watermark, cursor.as_deref(), &mut pages)
                .await?;
            counts.listings.processed += page.records.len() as u32;

            let mut batch = Vec::with_capacity(page.records.len());
            for raw in &page.records {
                match normalize_listing(source, raw) {
                    Ok(listing) => {
                        seen.insert(listing.listing_key.clone());
                        batch.push(listing);
                    }
                    Err(e) => {
                        log::warn!("[sync] Skipping record from '{}': {}", source, e);
                        counts.listings.malformed += 1;
                    }
                }
            }

            let outcome = self.engine.apply_listings(batch).await?;
            counts.listings.upserted += outcome.upserted;
            counts.listings.stale += outcome.stale;

            for listing in &outcome.applied {
                match linker.link(listing).await? {
                    LinkOutcome::Resolved => counts.agents_resolved += 1,
                    LinkOutcome::Unresolved(_) => counts.unresolved_links += 1,
                    LinkOutcome::NoAgent | LinkOutcome::AlreadyLinked => {}
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(seen)
    }

    async fn next_page(
        &self,
        provider: &dyn ProviderClient,
        kind: RecordKind,
        watermark: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        pages: &mut u32,
    ) -> Result<Page> {
        if *pages >= self.settings.max_pages {
            return Err(Error::internal(format!(
                "{} fetch exceeded {} pages without finishing",
                kind, self.settings.max_pages
            )));
        }
        *pages += 1;
        self.fetch_page_with_retry(provider, kind, watermark, cursor).await
    }

    /// Fetch one page, retrying retryable failures with exponential backoff
    ///
    /// Every attempt carries the request timeout; an elapsed timeout counts
    /// as a transport failure. Auth and parse errors are returned at once.
    pub async fn fetch_page_with_retry(
        &self,
        provider: &dyn ProviderClient,
        kind: RecordKind,
        watermark: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let mut attempt = 1;
        let mut backoff = self.settings.retry_backoff();

        loop {
            let fetched = tokio::time::timeout(
                self.settings.request_timeout(),
                provider.fetch_changes(kind, watermark, self.settings.page_size, cursor),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Transport(format!(
                    "Request timed out after {}s",
                    self.settings.request_timeout_secs
                )))
            });

            match fetched {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.settings.max_page_attempts => {
                    log::warn!(
                        "[sync] {} page fetch from '{}' failed (attempt {}/{}): {}; retrying in {:?}",
                        kind,
                        provider.source_name(),
                        attempt,
                        self.settings.max_page_attempts,
                        e,
                        backoff
                    );
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Backoff plus up to 25% random jitter, so sources retrying together spread out
fn jittered(backoff: Duration) -> Duration {
    let max_jitter = backoff.as_millis() as u64 / 4;
    if max_jitter == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..50 {
            let d = jittered(base);
            assert!(d >= base && d <= Duration::from_millis(500));
        }
        assert_eq!(jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }
}
