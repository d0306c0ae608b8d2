//! Archival/Cleanup Scheduler
//!
//! Runs independently of sync runs. On each tick for a source it archives
//! active listings that either carry a terminal provider status or were last
//! modified before the retention window. Already-archived rows are never
//! touched, so re-running is a no-op.
//!
//! ```text
//! CleanupScheduler (tokio-cron-scheduler)
//!     │
//!     ├─► job "mred"  (0 0 3 * * *)  ─► run_cleanup(pool, "mred")
//!     └─► job "crmls" (0 30 4 * * *) ─► run_cleanup(pool, "crmls")
//! ```
//!
//! Schedules are persisted per source in `cleanup_schedules`; a source
//! without a row uses `CleanupSchedule::default_for`. A running scheduler
//! sees schedules saved elsewhere only after `reload`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use super::provider::registry::list_sources;
use super::store::RecordStore;
use crate::error::{Error, Result};
use crate::models::{CleanupReport, CleanupSchedule};
use crate::utils::{format_timestamp, parse_opt_timestamp};

// ============================================================================
// Schedule persistence
// ============================================================================

#[derive(Debug, Clone, FromRow)]
struct CleanupScheduleRow {
    source: String,
    cron_expression: String,
    enabled: bool,
    retention_days: i64,
    terminal_statuses: String,
    last_run_at: Option<String>,
    updated_at: Option<String>,
}

impl CleanupScheduleRow {
    fn to_schedule(&self) -> CleanupSchedule {
        let terminal_statuses = serde_json::from_str(&self.terminal_statuses).unwrap_or_else(|e| {
            log::warn!(
                "[cleanup] Unreadable terminal statuses for '{}': {}",
                self.source,
                e
            );
            Vec::new()
        });

        CleanupSchedule {
            source: self.source.clone(),
            cron_expression: self.cron_expression.clone(),
            enabled: self.enabled,
            retention_days: u32::try_from(self.retention_days).unwrap_or(0),
            terminal_statuses,
            last_run_at: parse_opt_timestamp(&self.last_run_at),
            updated_at: parse_opt_timestamp(&self.updated_at),
        }
    }
}

/// Check a schedule before it is saved or registered
pub fn validate_schedule(schedule: &CleanupSchedule) -> Result<()> {
    if schedule.source.trim().is_empty() {
        return Err(Error::validation("Cleanup schedule needs a source"));
    }
    if schedule.retention_days == 0 {
        return Err(Error::validation("Retention window must be at least 1 day"));
    }
    // The scheduler's own parser is the authority on what it will accept
    Job::new_async(schedule.cron_expression.as_str(), |_uuid, _lock| Box::pin(async {}))
        .map_err(|e| {
            Error::validation(format!(
                "Invalid cron expression '{}': {:?}",
                schedule.cron_expression, e
            ))
        })?;
    Ok(())
}

/// Schedule for a source, falling back to the default when none is saved
pub async fn get_schedule(pool: &SqlitePool, source: &str) -> Result<CleanupSchedule> {
    let row: Option<CleanupScheduleRow> = sqlx::query_as(
        r#"
        SELECT source, cron_expression, enabled, retention_days, terminal_statuses,
               last_run_at, updated_at
        FROM cleanup_schedules WHERE source = ?
        "#,
    )
    .bind(source)
    .fetch_optional(pool)
    .await?;

    Ok(row
        .map(|r| r.to_schedule())
        .unwrap_or_else(|| CleanupSchedule::default_for(source)))
}

/// All saved schedules
pub async fn list_schedules(pool: &SqlitePool) -> Result<Vec<CleanupSchedule>> {
    let rows: Vec<CleanupScheduleRow> = sqlx::query_as(
        r#"
        SELECT source, cron_expression, enabled, retention_days, terminal_statuses,
               last_run_at, updated_at
        FROM cleanup_schedules ORDER BY source
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(CleanupScheduleRow::to_schedule).collect())
}

/// Validate and persist a schedule; `last_run_at` is preserved
pub async fn save_schedule(pool: &SqlitePool, schedule: &CleanupSchedule) -> Result<CleanupSchedule> {
    validate_schedule(schedule)?;

    let statuses = serde_json::to_string(&schedule.terminal_statuses)?;
    let now = format_timestamp(&Utc::now());

    sqlx::query(
        r#"
        INSERT INTO cleanup_schedules
        (source, cron_expression, enabled, retention_days, terminal_statuses, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET
            cron_expression = excluded.cron_expression,
            enabled = excluded.enabled,
            retention_days = excluded.retention_days,
            terminal_statuses = excluded.terminal_statuses,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&schedule.source)
    .bind(&schedule.cron_expression)
    .bind(schedule.enabled)
    .bind(schedule.retention_days as i64)
    .bind(&statuses)
    .bind(&now)
    .execute(pool)
    .await?;

    log::info!(
        "[cleanup] Saved schedule for '{}': '{}' (enabled: {}, retention: {}d)",
        schedule.source,
        schedule.cron_expression,
        schedule.enabled,
        schedule.retention_days
    );

    get_schedule(pool, &schedule.source).await
}

// ============================================================================
// Cleanup pass
// ============================================================================

/// Run one archival pass for `source` using its schedule's rules
///
/// Works whether or not the schedule is enabled, so it doubles as the manual
/// trigger.
pub async fn run_cleanup(pool: &SqlitePool, source: &str, now: DateTime<Utc>) -> Result<CleanupReport> {
    let schedule = get_schedule(pool, source).await?;
    let store = RecordStore::new(pool.clone());

    let terminal_archived = store
        .archive_terminal_listings(source, &schedule.terminal_statuses, now)
        .await?;

    let cutoff = now - Duration::days(schedule.retention_days.max(1) as i64);
    let stale_archived = store
        .archive_listings_modified_before(source, cutoff, now)
        .await?;

    // Only a saved schedule records its last run
    sqlx::query("UPDATE cleanup_schedules SET last_run_at = ? WHERE source = ?")
        .bind(format_timestamp(&now))
        .bind(source)
        .execute(pool)
        .await?;

    let report = CleanupReport {
        source: source.to_string(),
        terminal_archived,
        stale_archived,
        ran_at: now,
    };

    log::info!(
        "[cleanup] '{}': archived {} terminal and {} stale listing(s)",
        source,
        report.terminal_archived,
        report.stale_archived
    );
    Ok(report)
}

// ============================================================================
// CleanupScheduler
// ============================================================================

struct RegisteredJob {
    id: Uuid,
    cron_expression: String,
}

/// Cron-driven runner for cleanup passes, reconfigurable at runtime
pub struct CleanupScheduler {
    pool: SqlitePool,
    scheduler: JobScheduler,
    jobs: Arc<Mutex<HashMap<String, RegisteredJob>>>,
}

impl CleanupScheduler {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            pool,
            scheduler,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Register a job for every enabled source and start ticking
    ///
    /// Returns the number of jobs registered.
    pub async fn start(&self) -> Result<usize> {
        for source in list_sources(&self.pool).await? {
            if !source.enabled {
                continue;
            }
            let schedule = get_schedule(&self.pool, &source.name).await?;
            self.register(&schedule).await?;
        }

        self.scheduler.start().await?;

        let count = self.jobs.lock().await.len();
        log::info!("[cleanup] Scheduler started with {} job(s)", count);
        Ok(count)
    }

    /// Re-read saved schedules and bring the registered jobs in line
    ///
    /// Picks up schedules and sources changed by another process. Retention
    /// and terminal statuses are read on every pass, so only a cron change,
    /// an enable or a disable touches a job. Returns the number of sources
    /// whose job changed.
    pub async fn reload(&self) -> Result<usize> {
        let mut wanted: HashMap<String, CleanupSchedule> = HashMap::new();
        for source in list_sources(&self.pool).await? {
            if !source.enabled {
                continue;
            }
            let schedule = get_schedule(&self.pool, &source.name).await?;
            if schedule.enabled {
                wanted.insert(source.name, schedule);
            }
        }

        let current: HashMap<String, String> = self
            .jobs
            .lock()
            .await
            .iter()
            .map(|(source, job)| (source.clone(), job.cron_expression.clone()))
            .collect();

        let mut changed = 0;
        for source in current.keys() {
            if !wanted.contains_key(source) {
                self.unregister(source).await?;
                changed += 1;
            }
        }
        for (source, schedule) in &wanted {
            if current.get(source) != Some(&schedule.cron_expression) {
                self.register(schedule).await?;
                changed += 1;
            }
        }

        if changed > 0 {
            log::info!("[cleanup] Reload changed {} job(s)", changed);
        }
        Ok(changed)
    }

    /// Persist a new schedule and swap the running job for it
    pub async fn update_schedule(&self, schedule: &CleanupSchedule) -> Result<CleanupSchedule> {
        let saved = save_schedule(&self.pool, schedule).await?;
        self.register(&saved).await?;
        Ok(saved)
    }

    /// Replace the job for a schedule's source; disabled schedules only unregister
    async fn register(&self, schedule: &CleanupSchedule) -> Result<()> {
        let mut jobs = self.jobs.lock().await;

        if let Some(old) = jobs.remove(&schedule.source) {
            self.scheduler.remove(&old.id).await?;
            log::debug!("[cleanup] Removed previous job for '{}'", schedule.source);
        }

        if !schedule.enabled {
            log::info!("[cleanup] Schedule for '{}' is disabled", schedule.source);
            return Ok(());
        }

        let pool = self.pool.clone();
        let source_name = schedule.source.clone();
        let job = Job::new_async(schedule.cron_expression.as_str(), move |_uuid, _lock| {
            let pool = pool.clone();
            let source = source_name.clone();
            Box::pin(async move {
                if let Err(e) = run_cleanup(&pool, &source, Utc::now()).await {
                    log::error!("[cleanup] Scheduled cleanup for '{}' failed: {}", source, e);
                }
            })
        })?;

        let id = self.scheduler.add(job).await?;
        jobs.insert(
            schedule.source.clone(),
            RegisteredJob {
                id,
                cron_expression: schedule.cron_expression.clone(),
            },
        );

        log::info!(
            "[cleanup] Registered '{}' for '{}'",
            schedule.cron_expression,
            schedule.source
        );
        Ok(())
    }

    async fn unregister(&self, source: &str) -> Result<()> {
        if let Some(old) = self.jobs.lock().await.remove(source) {
            self.scheduler.remove(&old.id).await?;
            log::info!("[cleanup] Unregistered '{}'", source);
        }
        Ok(())
    }

    /// Sources with a registered job
    pub async fn scheduled_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Next tick for a source's job, if one is registered
    pub async fn next_run(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        let id = match self.jobs.lock().await.get(source) {
            Some(job) => job.id,
            None => return Ok(None),
        };
        let mut scheduler = self.scheduler.clone();
        Ok(scheduler.next_tick_for_job(id).await?)
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler.shutdown().await?;
        log::info!("[cleanup] Scheduler stopped");
        Ok(())
    }
}
