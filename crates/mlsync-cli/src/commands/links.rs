//! Listing-agent link commands

use anyhow::Result;
use clap::Subcommand;
use mlsync_core::RecordStore;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{print_output, print_success};

#[derive(Subcommand)]
pub enum LinksAction {
    /// List active listings whose agent is missing locally
    Dangling {
        source: String,
    },

    /// Fetch missing agents for dangling listings
    Repair {
        source: String,
    },
}

#[derive(Debug, Serialize, Tabled)]
pub struct DanglingRow {
    #[tabled(rename = "Listing")]
    pub listing_key: String,
    #[tabled(rename = "Agent Key")]
    pub list_agent_key: String,
}

#[derive(Debug, Serialize, Tabled)]
pub struct RepairRow {
    #[tabled(rename = "Checked")]
    pub checked: u32,
    #[tabled(rename = "Resolved")]
    pub resolved: u32,
    #[tabled(rename = "Unresolved")]
    pub unresolved: u32,
}

pub async fn execute(ctx: &Context, action: LinksAction) -> Result<()> {
    match action {
        LinksAction::Dangling { source } => dangling(ctx, source).await,
        LinksAction::Repair { source } => repair(ctx, source).await,
    }
}

async fn dangling(ctx: &Context, source: String) -> Result<()> {
    let store = RecordStore::new(ctx.db.pool.clone());
    let rows: Vec<DanglingRow> = store
        .dangling_agent_links(&source)
        .await?
        .into_iter()
        .map(|link| DanglingRow {
            listing_key: link.listing_key,
            list_agent_key: link.list_agent_key,
        })
        .collect();

    print_output(&rows, &rows, ctx.format)
}

async fn repair(ctx: &Context, source: String) -> Result<()> {
    let orchestrator = ctx.orchestrator().await?;
    let report = orchestrator.repair_links(&source).await?;

    let row = RepairRow {
        checked: report.checked,
        resolved: report.resolved,
        unresolved: report.unresolved,
    };
    print_output(&report, &[row], ctx.format)?;
    print_success(
        &format!("Resolved {} of {} dangling link(s)", report.resolved, report.checked),
        ctx.quiet,
    );
    Ok(())
}
