//! MLSync CLI - MLS listing and agent synchronization
//!
//! A command-line interface for configuring MLS sources, running syncs,
//! inspecting sync history and managing cleanup schedules.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mlsync")]
#[command(author, version, about = "MLS synchronization engine CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Show engine log output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Override database path (or set MLSYNC_DB_PATH env var)
    #[arg(long, env = "MLSYNC_DB_PATH", global = true)]
    db: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run syncs and inspect sync history
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },

    /// Manage MLS sources
    Source {
        #[command(subcommand)]
        action: commands::source::SourceAction,
    },

    /// Manage listing cleanup schedules
    Cleanup {
        #[command(subcommand)]
        action: commands::cleanup::CleanupAction,
    },

    /// Inspect and repair listing-agent links
    Links {
        #[command(subcommand)]
        action: commands::links::LinksAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // Set up database path if provided
    if let Some(db_path) = &cli.db {
        std::env::set_var("MLSYNC_DB_PATH", shellexpand::tilde(db_path).to_string());
    }

    let db = mlsync_core::Database::new().await?;

    let ctx = commands::Context {
        db,
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Sync { action } => commands::sync::execute(&ctx, action).await,
        Commands::Source { action } => commands::source::execute(&ctx, action).await,
        Commands::Cleanup { action } => commands::cleanup::execute(&ctx, action).await,
        Commands::Links { action } => commands::links::execute(&ctx, action).await,
    }
}
