//! Visionary CLI - Command-line interface for the Visionary job service.
//!
//! Submits jobs, follows their results and inspects service health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, job, tasks};
use output::OutputFormat;

/// Visionary - background job service CLI
#[derive(Parser)]
#[command(
    name = "visionary",
    version,
    about = "Visionary - background job service",
    long_about = "CLI tool for submitting jobs, following their results and checking the Visionary job service.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "VISIONARY_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit jobs and follow their results
    #[command(subcommand)]
    Job(job::JobCommands),

    /// List registered task types
    Tasks,

    /// Show worker pool statistics
    Workers,

    /// Check service health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(|| config::load_value(config::API_URL_KEY))
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Job(cmd) => job::execute(cmd, &client, format).await,
        Commands::Tasks => tasks::execute(&client, format).await,
        Commands::Workers => health::workers(&client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
