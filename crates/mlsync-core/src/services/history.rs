//! Sync History Recorder
//!
//! Append-only log of sync runs in `sync_runs`. `begin` is a transactional
//! insert-if-absent: the insert only happens when the source has no
//! `in_progress` row, and a partial unique index backs that up, so two
//! schedulers racing into `begin` cannot both win.
//!
//! A crashed process leaves its run `in_progress`. The next `begin` for that
//! source fails any such run older than the reclaim timeout before inserting.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    EntityCounts, HistoryFilter, PaginatedResponse, SyncCounts, SyncMode, SyncRun, SyncRunStatus,
};
use crate::utils::{format_timestamp, parse_opt_timestamp, parse_timestamp};

/// Largest page `history` will return
pub const MAX_HISTORY_PAGE_SIZE: i64 = 100;

/// `error_kind` recorded on runs failed by orphan reclaim
pub const RECLAIMED_ERROR_KIND: &str = "reclaimed";

const RUN_COLUMNS: &str = "id, source, mode, status, started_at, finished_at, duration_ms, \
     listings_processed, listings_upserted, listings_stale, listings_malformed, \
     agents_processed, agents_upserted, agents_stale, agents_malformed, \
     listings_archived, unresolved_links, agents_resolved, error_kind, error_message";

// ============================================================================
// Database Row Types
// ============================================================================

#[derive(Debug, Clone, FromRow)]
struct SyncRunRow {
    id: String,
    source: String,
    mode: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
    listings_processed: i64,
    listings_upserted: i64,
    listings_stale: i64,
    listings_malformed: i64,
    agents_processed: i64,
    agents_upserted: i64,
    agents_stale: i64,
    agents_malformed: i64,
    listings_archived: i64,
    unresolved_links: i64,
    agents_resolved: i64,
    error_kind: Option<String>,
    error_message: Option<String>,
}

impl SyncRunRow {
    /// Returns `None` if the row holds an unknown mode/status or a bad start time
    fn to_sync_run(&self) -> Option<SyncRun> {
        let mode = self.mode.parse::<SyncMode>().ok()?;
        let status = self.status.parse::<SyncRunStatus>().ok()?;
        let started_at = parse_timestamp(&self.started_at)?;

        Some(SyncRun {
            id: self.id.clone(),
            source: self.source.clone(),
            mode,
            status,
            started_at,
            finished_at: parse_opt_timestamp(&self.finished_at),
            duration_ms: self.duration_ms,
            counts: SyncCounts {
                listings: EntityCounts {
                    processed: count(self.listings_processed),
                    upserted: count(self.listings_upserted),
                    stale: count(self.listings_stale),
                    malformed: count(self.listings_malformed),
                },
                agents: EntityCounts {
                    processed: count(self.agents_processed),
                    upserted: count(self.agents_upserted),
                    stale: count(self.agents_stale),
                    malformed: count(self.agents_malformed),
                },
                archived: count(self.listings_archived),
                unresolved_links: count(self.unresolved_links),
                agents_resolved: count(self.agents_resolved),
            },
            error_kind: self.error_kind.clone(),
            error_message: self.error_message.clone(),
        })
    }
}

fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn into_run(row: SyncRunRow) -> Option<SyncRun> {
    let run = row.to_sync_run();
    if run.is_none() {
        log::warn!("[sync:history] Ignoring unreadable run row '{}'", row.id);
    }
    run
}

// ============================================================================
// SyncHistory
// ============================================================================

/// Durable record of sync runs
#[derive(Clone)]
pub struct SyncHistory {
    pool: SqlitePool,
    reclaim_timeout: chrono::Duration,
}

impl SyncHistory {
    pub fn new(pool: SqlitePool, reclaim_timeout: chrono::Duration) -> Self {
        Self {
            pool,
            reclaim_timeout,
        }
    }

    /// Start a run for `source`
    ///
    /// Fails with `Error::ConcurrentRun` when the source already has a live
    /// `in_progress` run; the existing run is left untouched.
    pub async fn begin(&self, source: &str, mode: SyncMode) -> Result<SyncRun> {
        self.begin_at(source, mode, Utc::now()).await
    }

    pub(crate) async fn begin_at(
        &self,
        source: &str,
        mode: SyncMode,
        now: DateTime<Utc>,
    ) -> Result<SyncRun> {
        self.reclaim_orphans(source, now).await?;

        let id = Uuid::new_v4().to_string();
        let started_at = format_timestamp(&now);

        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_runs (id, source, mode, status, started_at)
            SELECT ?, ?, ?, 'in_progress', ?
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_runs WHERE source = ? AND status = 'in_progress'
            )
            "#,
        )
        .bind(&id)
        .bind(source)
        .bind(mode.as_str())
        .bind(&started_at)
        .bind(source)
        .execute(&self.pool)
        .await;

        let rows = match inserted {
            Ok(result) => result.rows_affected(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => 0,
            Err(e) => return Err(e.into()),
        };

        if rows == 0 {
            log::info!("[sync:history] '{}' already has a run in progress", source);
            return Err(Error::ConcurrentRun {
                source_name: source.to_string(),
            });
        }

        log::info!("[sync:history] Began {} run {} for '{}'", mode, id, source);

        Ok(SyncRun {
            id,
            source: source.to_string(),
            mode,
            status: SyncRunStatus::InProgress,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            counts: SyncCounts::default(),
            error_kind: None,
            error_message: None,
        })
    }

    /// Fail `in_progress` runs of `source` started before the reclaim cutoff
    async fn reclaim_orphans(&self, source: &str, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.reclaim_timeout;
        let finished_at = format_timestamp(&now);

        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'failed',
                finished_at = ?,
                duration_ms = CAST((julianday(?) - julianday(started_at)) * 86400000 AS INTEGER),
                error_kind = ?,
                error_message = ?
            WHERE source = ? AND status = 'in_progress' AND started_at < ?
            "#,
        )
        .bind(&finished_at)
        .bind(&finished_at)
        .bind(RECLAIMED_ERROR_KIND)
        .bind("Run never finished; reclaimed after timeout")
        .bind(source)
        .bind(format_timestamp(&cutoff))
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            log::warn!(
                "[sync:history] Reclaimed {} orphaned run(s) for '{}'",
                reclaimed,
                source
            );
        }
        Ok(reclaimed)
    }

    /// Mark a run successful with its final counts
    pub async fn complete(&self, run_id: &str, counts: &SyncCounts) -> Result<SyncRun> {
        self.finish(run_id, SyncRunStatus::Success, counts, None, None)
            .await
    }

    /// Mark a run failed
    pub async fn fail(
        &self,
        run_id: &str,
        counts: &SyncCounts,
        error_kind: &str,
        error_message: &str,
    ) -> Result<SyncRun> {
        self.finish(
            run_id,
            SyncRunStatus::Failed,
            counts,
            Some(error_kind),
            Some(error_message),
        )
        .await
    }

    async fn finish(
        &self,
        run_id: &str,
        status: SyncRunStatus,
        counts: &SyncCounts,
        error_kind: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<SyncRun> {
        let run = self
            .get(run_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Sync run {}", run_id)))?;

        if run.status.is_terminal() {
            return Err(Error::validation(format!(
                "Sync run {} is already {}",
                run_id, run.status
            )));
        }

        let now = Utc::now();
        let duration_ms = (now - run.started_at).num_milliseconds().max(0);

        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = ?, finished_at = ?, duration_ms = ?,
                listings_processed = ?, listings_upserted = ?,
                listings_stale = ?, listings_malformed = ?,
                agents_processed = ?, agents_upserted = ?,
                agents_stale = ?, agents_malformed = ?,
                listings_archived = ?, unresolved_links = ?, agents_resolved = ?,
                error_kind = ?, error_message = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(status.as_str())
        .bind(format_timestamp(&now))
        .bind(duration_ms)
        .bind(counts.listings.processed as i64)
        .bind(counts.listings.upserted as i64)
        .bind(counts.listings.stale as i64)
        .bind(counts.listings.malformed as i64)
        .bind(counts.agents.processed as i64)
        .bind(counts.agents.upserted as i64)
        .bind(counts.agents.stale as i64)
        .bind(counts.agents.malformed as i64)
        .bind(counts.archived as i64)
        .bind(counts.unresolved_links as i64)
        .bind(counts.agents_resolved as i64)
        .bind(error_kind)
        .bind(error_message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Reclaimed between the read above and this update
            return Err(Error::validation(format!(
                "Sync run {} is no longer in progress",
                run_id
            )));
        }

        log::info!(
            "[sync:history] Run {} for '{}' finished: {} in {}ms",
            run_id,
            run.source,
            status,
            duration_ms
        );

        Ok(SyncRun {
            status,
            finished_at: Some(now),
            duration_ms: Some(duration_ms),
            counts: *counts,
            error_kind: error_kind.map(str::to_string),
            error_message: error_message.map(str::to_string),
            ..run
        })
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<SyncRun>> {
        let sql = format!("SELECT {} FROM sync_runs WHERE id = ?", RUN_COLUMNS);
        let row: Option<SyncRunRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(into_run))
    }

    /// Most recently started run for a source
    pub async fn latest(&self, source: &str) -> Result<Option<SyncRun>> {
        let sql = format!(
            "SELECT {} FROM sync_runs WHERE source = ? ORDER BY started_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row: Option<SyncRunRow> = sqlx::query_as(&sql)
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(into_run))
    }

    /// The run currently holding the source, if any
    pub async fn in_progress(&self, source: &str) -> Result<Option<SyncRun>> {
        let sql = format!(
            "SELECT {} FROM sync_runs WHERE source = ? AND status = 'in_progress' LIMIT 1",
            RUN_COLUMNS
        );
        let row: Option<SyncRunRow> = sqlx::query_as(&sql)
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(into_run))
    }

    /// Page through a source's runs, newest first
    ///
    /// `page` is 1-based; `page_size` is clamped to 1..=100.
    pub async fn history(
        &self,
        source: &str,
        page: i64,
        page_size: i64,
        filter: &HistoryFilter,
    ) -> Result<PaginatedResponse<SyncRun>> {
        let page = page.max(1);
        let per_page = page_size.clamp(1, MAX_HISTORY_PAGE_SIZE);
        // Pages past the end just come back empty
        let offset = (page - 1).saturating_mul(per_page);

        let status = filter.status.map(|s| s.as_str());
        let mode = filter.mode.map(|m| m.as_str());

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sync_runs
            WHERE source = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR mode = ?)
            "#,
        )
        .bind(source)
        .bind(status)
        .bind(status)
        .bind(mode)
        .bind(mode)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {} FROM sync_runs
            WHERE source = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR mode = ?)
            ORDER BY started_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
            RUN_COLUMNS
        );
        let rows: Vec<SyncRunRow> = sqlx::query_as(&sql)
            .bind(source)
            .bind(status)
            .bind(status)
            .bind(mode)
            .bind(mode)
            .bind(per_page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let items: Vec<SyncRun> = rows.into_iter().filter_map(into_run).collect();
        let pages = (total + per_page - 1) / per_page;

        Ok(PaginatedResponse {
            items,
            total,
            page,
            per_page,
            pages,
        })
    }
}
