//! Sync commands
//!
//! Run syncs for one or all sources and inspect per-source status and history.

use anyhow::Result;
use clap::Subcommand;
use mlsync_core::{HistoryFilter, SyncMode, SyncResult, SyncRun, SyncRunStatus};
use serde::Serialize;
use tabled::Tabled;

use super::{format_time, Context};
use crate::output::{print_error, print_info, print_output, print_success, print_warning};

#[derive(Subcommand)]
pub enum SyncAction {
    /// Sync one source
    Run {
        /// Source name
        source: String,

        /// Sync mode: incremental (default) or full
        #[arg(short, long, default_value = "incremental")]
        mode: SyncMode,
    },

    /// Sync every enabled source in turn
    All {
        /// Sync mode: incremental (default) or full
        #[arg(short, long, default_value = "incremental")]
        mode: SyncMode,
    },

    /// Show current status for each source
    Status {
        /// Only show this source
        source: Option<String>,
    },

    /// Show past runs of a source, newest first
    History {
        /// Source name
        source: String,

        #[arg(long, default_value = "1")]
        page: i64,

        #[arg(long, default_value = "20")]
        page_size: i64,

        /// Only runs with this status (in_progress, success, failed)
        #[arg(long)]
        status: Option<SyncRunStatus>,

        /// Only runs of this mode
        #[arg(long)]
        mode: Option<SyncMode>,
    },
}

/// One sync outcome for table display
#[derive(Debug, Serialize, Tabled)]
pub struct SyncResultRow {
    #[tabled(rename = "Source")]
    pub source: String,
    #[tabled(rename = "Mode")]
    pub mode: String,
    #[tabled(rename = "Result")]
    pub result: String,
    #[tabled(rename = "Listings")]
    pub listings: String,
    #[tabled(rename = "Agents")]
    pub agents: String,
    #[tabled(rename = "Archived")]
    pub archived: u32,
    #[tabled(rename = "Unresolved")]
    pub unresolved: u32,
    #[tabled(rename = "Error")]
    pub error: String,
}

impl From<&SyncResult> for SyncResultRow {
    fn from(r: &SyncResult) -> Self {
        let result = if r.success {
            "success"
        } else if r.skipped {
            "skipped"
        } else {
            "failed"
        };
        Self {
            source: r.source.clone(),
            mode: r.mode.to_string(),
            result: result.to_string(),
            listings: format!("{}/{}", r.counts.listings.upserted, r.counts.listings.processed),
            agents: format!("{}/{}", r.counts.agents.upserted, r.counts.agents.processed),
            archived: r.counts.archived,
            unresolved: r.counts.unresolved_links,
            error: r.error.clone().unwrap_or_default(),
        }
    }
}

/// Source status for table display
#[derive(Debug, Serialize, Tabled)]
pub struct StatusRow {
    #[tabled(rename = "Source")]
    pub source: String,
    #[tabled(rename = "Last Run")]
    pub last_run: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Running")]
    pub running: String,
    #[tabled(rename = "Active")]
    pub active_listings: i64,
    #[tabled(rename = "Archived")]
    pub archived_listings: i64,
    #[tabled(rename = "Agents")]
    pub agents: i64,
}

/// Sync run for table display
#[derive(Debug, Serialize, Tabled)]
pub struct RunRow {
    #[tabled(rename = "Started")]
    pub started_at: String,
    #[tabled(rename = "Mode")]
    pub mode: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Duration")]
    pub duration: String,
    #[tabled(rename = "Listings")]
    pub listings: String,
    #[tabled(rename = "Stale")]
    pub stale: u32,
    #[tabled(rename = "Malformed")]
    pub malformed: u32,
    #[tabled(rename = "Archived")]
    pub archived: u32,
    #[tabled(rename = "Error")]
    pub error: String,
}

impl From<&SyncRun> for RunRow {
    fn from(run: &SyncRun) -> Self {
        Self {
            started_at: format_time(Some(run.started_at)),
            mode: run.mode.to_string(),
            status: run.status.to_string(),
            duration: run
                .duration_ms
                .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string()),
            listings: format!(
                "{}/{}",
                run.counts.listings.upserted, run.counts.listings.processed
            ),
            stale: run.counts.listings.stale + run.counts.agents.stale,
            malformed: run.counts.malformed(),
            archived: run.counts.archived,
            error: run.error_message.clone().unwrap_or_default(),
        }
    }
}

pub async fn execute(ctx: &Context, action: SyncAction) -> Result<()> {
    match action {
        SyncAction::Run { source, mode } => run_one(ctx, source, mode).await,
        SyncAction::All { mode } => run_all(ctx, mode).await,
        SyncAction::Status { source } => show_status(ctx, source).await,
        SyncAction::History {
            source,
            page,
            page_size,
            status,
            mode,
        } => show_history(ctx, source, page, page_size, HistoryFilter { status, mode }).await,
    }
}

async fn run_one(ctx: &Context, source: String, mode: SyncMode) -> Result<()> {
    let orchestrator = ctx.orchestrator().await?;

    print_info(&format!("Running {} sync of {}...", mode, source), ctx.quiet);
    let result = orchestrator.sync_source(&source, mode).await;

    report_result(ctx, &result);
    print_output(&result, &[SyncResultRow::from(&result)], ctx.format)?;

    if !result.is_ok() {
        anyhow::bail!(
            "Sync of {} failed: {}",
            source,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_all(ctx: &Context, mode: SyncMode) -> Result<()> {
    let orchestrator = ctx.orchestrator().await?;

    let sources = orchestrator.sources();
    if sources.is_empty() {
        print_info("No enabled sources.", ctx.quiet);
        print_info("Use 'mlsync source add <name> <base-url>' to add one.", ctx.quiet);
        return Ok(());
    }

    print_info(
        &format!("Running {} sync of {} source(s)...", mode, sources.len()),
        ctx.quiet,
    );
    let all = orchestrator.sync_all(mode).await;

    for result in &all.results {
        report_result(ctx, result);
    }
    let rows: Vec<SyncResultRow> = all.results.iter().map(SyncResultRow::from).collect();
    print_output(&all, &rows, ctx.format)?;

    if !all.success {
        anyhow::bail!("One or more sources failed to sync");
    }
    Ok(())
}

fn report_result(ctx: &Context, result: &SyncResult) {
    if result.success {
        print_success(&format!("  {} synced", result.source), ctx.quiet);
    } else if result.skipped {
        print_warning(
            &format!("  {} skipped: a run is already in progress", result.source),
            ctx.quiet,
        );
    } else {
        print_error(&format!(
            "  {} failed ({}): {}",
            result.source,
            result.error_kind.as_deref().unwrap_or("unknown"),
            result.error.as_deref().unwrap_or("-")
        ));
    }
}

async fn show_status(ctx: &Context, source: Option<String>) -> Result<()> {
    let sources = match source {
        Some(name) => vec![name],
        None => mlsync_core::services::list_sources(&ctx.db.pool)
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect(),
    };

    let orchestrator = ctx.orchestrator().await?;
    let mut reports = Vec::with_capacity(sources.len());
    for name in &sources {
        reports.push(orchestrator.status(name).await?);
    }

    let rows: Vec<StatusRow> = reports
        .iter()
        .map(|r| StatusRow {
            source: r.source.clone(),
            last_run: format_time(r.latest_run.as_ref().map(|run| run.started_at)),
            status: r
                .latest_run
                .as_ref()
                .map(|run| run.status.to_string())
                .unwrap_or_else(|| "never".to_string()),
            running: if r.in_progress { "yes" } else { "no" }.to_string(),
            active_listings: r.active_listings,
            archived_listings: r.archived_listings,
            agents: r.agents,
        })
        .collect();

    print_output(&reports, &rows, ctx.format)
}

async fn show_history(
    ctx: &Context,
    source: String,
    page: i64,
    page_size: i64,
    filter: HistoryFilter,
) -> Result<()> {
    let orchestrator = ctx.orchestrator().await?;
    let history = orchestrator.history(&source, page, page_size, &filter).await?;

    let rows: Vec<RunRow> = history.items.iter().map(RunRow::from).collect();
    print_output(&history, &rows, ctx.format)?;
    if ctx.format == crate::output::OutputFormat::Table {
        print_info(
            &format!(
                "Page {} of {} ({} run(s))",
                history.page, history.pages, history.total
            ),
            ctx.quiet,
        );
    }
    Ok(())
}
