//! Cleanup commands
//!
//! Show and edit per-source cleanup schedules, trigger a pass by hand, or run
//! the cron scheduler in the foreground.

use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use mlsync_core::services::{get_schedule, list_sources, run_cleanup, save_schedule};
use mlsync_core::{CleanupReport, CleanupSchedule, CleanupScheduler};
use serde::Serialize;
use tabled::Tabled;

use super::{format_time, Context};

/// How often a running scheduler re-reads saved schedules
const RELOAD_INTERVAL: Duration = Duration::from_secs(60);
use crate::output::{print_info, print_output, print_success};

#[derive(Subcommand)]
pub enum CleanupAction {
    /// Show cleanup schedules (defaults apply to sources without one)
    Show {
        /// Only show this source
        source: Option<String>,
    },

    /// Change a source's cleanup schedule
    Set {
        source: String,

        /// Cron expression with a seconds field, e.g. "0 0 3 * * *"
        #[arg(long)]
        cron: Option<String>,

        /// Archive listings not modified within this many days
        #[arg(long)]
        retention_days: Option<u32>,

        /// Provider status that archives a listing; repeat to give several
        #[arg(long = "terminal-status")]
        terminal_statuses: Option<Vec<String>>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Run one cleanup pass now
    Run {
        source: String,
    },

    /// Run scheduled cleanups until interrupted
    Start,
}

/// Schedule row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct ScheduleRow {
    #[tabled(rename = "Source")]
    pub source: String,
    #[tabled(rename = "Cron")]
    pub cron_expression: String,
    #[tabled(rename = "Enabled")]
    pub enabled: String,
    #[tabled(rename = "Retention")]
    pub retention: String,
    #[tabled(rename = "Terminal Statuses")]
    pub terminal_statuses: String,
    #[tabled(rename = "Last Run")]
    pub last_run_at: String,
}

impl From<&CleanupSchedule> for ScheduleRow {
    fn from(s: &CleanupSchedule) -> Self {
        Self {
            source: s.source.clone(),
            cron_expression: s.cron_expression.clone(),
            enabled: if s.enabled { "yes" } else { "no" }.to_string(),
            retention: format!("{}d", s.retention_days),
            terminal_statuses: s.terminal_statuses.join(", "),
            last_run_at: format_time(s.last_run_at),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct CleanupReportRow {
    #[tabled(rename = "Source")]
    pub source: String,
    #[tabled(rename = "Terminal")]
    pub terminal_archived: u64,
    #[tabled(rename = "Stale")]
    pub stale_archived: u64,
    #[tabled(rename = "Total")]
    pub total: u64,
}

impl From<&CleanupReport> for CleanupReportRow {
    fn from(r: &CleanupReport) -> Self {
        Self {
            source: r.source.clone(),
            terminal_archived: r.terminal_archived,
            stale_archived: r.stale_archived,
            total: r.total(),
        }
    }
}

pub async fn execute(ctx: &Context, action: CleanupAction) -> Result<()> {
    match action {
        CleanupAction::Show { source } => show(ctx, source).await,
        CleanupAction::Set {
            source,
            cron,
            retention_days,
            terminal_statuses,
            enable,
            disable,
        } => {
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            set(ctx, source, cron, retention_days, terminal_statuses, enabled).await
        }
        CleanupAction::Run { source } => run(ctx, source).await,
        CleanupAction::Start => start(ctx).await,
    }
}

async fn show(ctx: &Context, source: Option<String>) -> Result<()> {
    let names: Vec<String> = match source {
        Some(name) => vec![name],
        None => list_sources(&ctx.db.pool)
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect(),
    };

    let mut schedules = Vec::with_capacity(names.len());
    for name in &names {
        schedules.push(get_schedule(&ctx.db.pool, name).await?);
    }

    let rows: Vec<ScheduleRow> = schedules.iter().map(ScheduleRow::from).collect();
    print_output(&rows, &rows, ctx.format)
}

async fn set(
    ctx: &Context,
    source: String,
    cron: Option<String>,
    retention_days: Option<u32>,
    terminal_statuses: Option<Vec<String>>,
    enabled: Option<bool>,
) -> Result<()> {
    let mut schedule = get_schedule(&ctx.db.pool, &source).await?;

    if let Some(cron) = cron {
        schedule.cron_expression = cron;
    }
    if let Some(days) = retention_days {
        schedule.retention_days = days;
    }
    if let Some(statuses) = terminal_statuses {
        schedule.terminal_statuses = statuses;
    }
    if let Some(enabled) = enabled {
        schedule.enabled = enabled;
    }

    let saved = save_schedule(&ctx.db.pool, &schedule).await?;
    print_success(
        &format!("Saved cleanup schedule for {}: {}", saved.source, saved.cron_expression),
        ctx.quiet,
    );
    print_info(
        "A running 'mlsync cleanup start' picks this up within a minute.",
        ctx.quiet,
    );
    Ok(())
}

async fn run(ctx: &Context, source: String) -> Result<()> {
    print_info(&format!("Running cleanup for {}...", source), ctx.quiet);
    let report = run_cleanup(&ctx.db.pool, &source, chrono::Utc::now()).await?;

    print_output(&report, &[CleanupReportRow::from(&report)], ctx.format)?;
    print_success(
        &format!("Archived {} listing(s) for {}", report.total(), source),
        ctx.quiet,
    );
    Ok(())
}

async fn start(ctx: &Context) -> Result<()> {
    let scheduler = CleanupScheduler::new(ctx.db.pool.clone()).await?;
    let count = scheduler.start().await?;

    if count == 0 {
        print_info("No enabled sources to schedule yet.", ctx.quiet);
    }

    for source in scheduler.scheduled_sources().await {
        let next = scheduler.next_run(&source).await?;
        print_info(
            &format!("  {}: next cleanup at {}", source, format_time(next)),
            ctx.quiet,
        );
    }
    print_success(
        &format!("Cleanup scheduler running for {} source(s); press Ctrl-C to stop", count),
        ctx.quiet,
    );

    let mut reload = tokio::time::interval(RELOAD_INTERVAL);
    reload.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = reload.tick() => match scheduler.reload().await {
                Ok(0) => {}
                Ok(changed) => print_info(
                    &format!("Reloaded cleanup schedules ({} change(s))", changed),
                    ctx.quiet,
                ),
                Err(e) => log::warn!("[cleanup] Reloading schedules failed: {}", e),
            },
        }
    }

    print_info("Stopping scheduler...", ctx.quiet);
    scheduler.shutdown().await?;
    Ok(())
}
