//! Output formatting for the Visionary CLI.
//!
//! Supports table, JSON, and YAML output formats.

use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
    /// Render as YAML
    Yaml,
}

pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "[INFO]".blue().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "[WARN]".yellow().bold(), msg);
}

/// Print a list of items in the requested format.
pub fn print_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No results found.".dimmed());
                return;
            }
            let table = Table::new(items)
                .with(Style::rounded())
                .with(Modify::new(Columns::first()).with(Alignment::left()))
                .to_string();
            println!("{}", table);
        }
        _ => print_item(&items, format),
    }
}

/// Print a single item as JSON (also for table mode) or YAML.
pub fn print_item<T: Serialize + ?Sized>(item: &T, format: OutputFormat) {
    let rendered = match format {
        OutputFormat::Table | OutputFormat::Json => serde_json::to_string_pretty(item).map_err(|e| e.to_string()),
        OutputFormat::Yaml => serde_yaml::to_string(item).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => print_error(&format!("Failed to render output: {}", e)),
    }
}

pub fn print_detail(key: &str, value: &str) {
    println!("  {}: {}", key.cyan(), value);
}

/// Color a job or health status for table output.
pub fn status_colored(status: &str) -> ColoredString {
    match status {
        "completed" | "healthy" => status.green(),
        "failed" | "unhealthy" => status.red(),
        "retrying" | "degraded" => status.yellow(),
        "running" => status.cyan(),
        _ => status.normal(),
    }
}

pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
    println!();
}
