//! Source management commands
//!
//! Commands for configuring the MLS feeds the engine syncs from.

use anyhow::Result;
use clap::Subcommand;
use mlsync_core::services::{list_sources, remove_source, set_source_enabled, upsert_source};
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{print_error, print_info, print_output, print_success};

#[derive(Subcommand)]
pub enum SourceAction {
    /// List all configured sources
    List,

    /// Add a source, or update one with the same name
    Add {
        /// Unique source name, e.g. "mred"
        name: String,

        /// Provider Web API base URL
        base_url: String,

        /// Provider implementation
        #[arg(long, default_value = "reso")]
        kind: String,

        /// Bearer token for the provider API
        #[arg(long, env = "MLSYNC_ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Remove a source
    Remove {
        name: String,
    },

    /// Include a source in syncs and cleanup schedules
    Enable {
        name: String,
    },

    /// Exclude a source from syncs and cleanup schedules
    Disable {
        name: String,
    },
}

/// Source row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct SourceRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Kind")]
    pub kind: String,
    #[tabled(rename = "Base URL")]
    pub base_url: String,
    #[tabled(rename = "Token")]
    pub token: String,
    #[tabled(rename = "Status")]
    pub status: String,
}

pub async fn execute(ctx: &Context, action: SourceAction) -> Result<()> {
    match action {
        SourceAction::List => list(ctx).await,
        SourceAction::Add {
            name,
            base_url,
            kind,
            token,
        } => add(ctx, name, base_url, kind, token).await,
        SourceAction::Remove { name } => remove(ctx, name).await,
        SourceAction::Enable { name } => set_enabled(ctx, name, true).await,
        SourceAction::Disable { name } => set_enabled(ctx, name, false).await,
    }
}

async fn list(ctx: &Context) -> Result<()> {
    let sources = list_sources(&ctx.db.pool).await?;

    if sources.is_empty() {
        print_info("No sources configured.", ctx.quiet);
        print_info("Use 'mlsync source add <name> <base-url>' to add one.", ctx.quiet);
        return Ok(());
    }

    // Only token presence is shown
    let rows: Vec<SourceRow> = sources
        .into_iter()
        .map(|s| SourceRow {
            name: s.name,
            kind: s.kind,
            base_url: s.base_url,
            token: if s.access_token.is_some() { "set" } else { "-" }.to_string(),
            status: if s.enabled { "Enabled" } else { "Disabled" }.to_string(),
        })
        .collect();

    print_output(&rows, &rows, ctx.format)
}

async fn add(
    ctx: &Context,
    name: String,
    base_url: String,
    kind: String,
    token: Option<String>,
) -> Result<()> {
    let saved = upsert_source(&ctx.db.pool, &name, &kind, &base_url, token.as_deref()).await?;
    print_success(
        &format!("Saved source: {} ({}, {})", saved.name, saved.kind, saved.base_url),
        ctx.quiet,
    );
    Ok(())
}

async fn remove(ctx: &Context, name: String) -> Result<()> {
    if remove_source(&ctx.db.pool, &name).await? {
        print_success(&format!("Removed source: {}", name), ctx.quiet);
    } else {
        print_error(&format!("Source not found: {}", name));
    }
    Ok(())
}

async fn set_enabled(ctx: &Context, name: String, enabled: bool) -> Result<()> {
    set_source_enabled(&ctx.db.pool, &name, enabled).await?;
    let state = if enabled { "Enabled" } else { "Disabled" };
    print_success(&format!("{} source: {}", state, name), ctx.quiet);
    Ok(())
}
