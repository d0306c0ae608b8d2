//! Output formatting module
//!
//! Table and JSON rendering for CLI commands.

use serde::Serialize;
use std::fmt::Display;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {}. Use 'table' or 'json'", s)),
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Render `json` in JSON mode, `rows` as a table otherwise
///
/// The JSON side is usually the core result type, the table side its
/// flattened rows. Pass the rows twice when both are the same.
pub fn render<J, T>(json: &J, rows: &[T], format: OutputFormat) -> anyhow::Result<String>
where
    J: Serialize + ?Sized,
    T: Tabled,
{
    Ok(match format {
        OutputFormat::Table if rows.is_empty() => "No items found.".to_string(),
        OutputFormat::Table => Table::new(rows).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(json)?,
    })
}

pub fn print_output<J, T>(json: &J, rows: &[T], format: OutputFormat) -> anyhow::Result<()>
where
    J: Serialize + ?Sized,
    T: Tabled,
{
    println!("{}", render(json, rows, format)?);
    Ok(())
}

/// Print a success message (respects quiet mode)
pub fn print_success(message: &str, quiet: bool) {
    if !quiet {
        println!("{}", colored::Colorize::green(message));
    }
}

/// Print a warning message (respects quiet mode)
pub fn print_warning(message: &str, quiet: bool) {
    if !quiet {
        println!("{}", colored::Colorize::yellow(message));
    }
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{}", colored::Colorize::red(message));
}

/// Print an info message (respects quiet mode)
pub fn print_info(message: &str, quiet: bool) {
    if !quiet {
        println!("{}", message);
    }
}
