//! Health and worker commands.
//!
//! `health` queries `/health` (or `/health/ready`), `workers` shows pool statistics.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include detailed component checks
    #[arg(short, long)]
    detailed: bool,

    /// Query readiness instead of the full report
    #[arg(long)]
    ready: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    if args.ready {
        let readiness = client.get_raw("/health/ready").await?;
        let ready = readiness.get("ready").and_then(|v| v.as_bool()).unwrap_or(false);
        match format {
            OutputFormat::Table if ready => output::print_success("Service is ready"),
            OutputFormat::Table => {
                let reason = readiness
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown reason");
                output::print_error(&format!("Service is not ready: {}", reason));
            }
            _ => output::print_item(&readiness, format),
        }
        if !ready {
            anyhow::bail!("Service is not ready");
        }
        return Ok(());
    }

    let health = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            let status = health
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            output::print_header("Service Health");
            output::print_detail("Status", &output::status_colored(status).to_string());
            output::print_detail("API URL", client.base_url());

            for key in ["service", "version", "environment", "timestamp"] {
                if let Some(value) = health.get(key).and_then(|v| v.as_str()) {
                    output::print_detail(key, value);
                }
            }
            if let Some(uptime) = health.get("uptime_secs").and_then(|v| v.as_u64()) {
                output::print_detail("uptime", &format!("{}s", uptime));
            }

            if args.detailed {
                if let Some(components) = health.get("components").and_then(|v| v.as_array()) {
                    output::print_header("Components");
                    for comp in components {
                        let name = comp.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                        let comp_status = comp.get("status").and_then(|v| v.as_str()).unwrap_or("?");
                        let mut line = output::status_colored(comp_status).to_string();
                        if let Some(latency) = comp.get("latency_ms").and_then(|v| v.as_u64()) {
                            line.push_str(&format!(" ({}ms)", latency));
                        }
                        if let Some(message) = comp.get("message").and_then(|v| v.as_str()) {
                            line.push_str(&format!(" - {}", message));
                        }
                        output::print_detail(name, &line);
                    }
                }
            }

            match status {
                "healthy" => output::print_success("All systems operational"),
                "degraded" => output::print_warning("Service is degraded"),
                _ => output::print_error(&format!("Service status: {}", status)),
            }
        }
        _ => output::print_item(&health, format),
    }

    Ok(())
}

/// Worker pool statistics from `/api/v1/workers`.
pub async fn workers(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let workers: serde_json::Value = client.get("/api/v1/workers").await?;

    match format {
        OutputFormat::Table => {
            let status = workers.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
            output::print_header("Worker Pools");
            output::print_detail("Status", &output::status_colored(status).to_string());
            if let Some(message) = workers.get("message").and_then(|v| v.as_str()) {
                output::print_detail("Note", message);
            }
            if let Some(pools) = workers.get("metadata").and_then(|v| v.as_object()) {
                for (name, stats) in pools {
                    let field = |key: &str| stats.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
                    output::print_detail(
                        name,
                        &format!(
                            "busy={} processed={} succeeded={} retried={} failed={} timed_out={}",
                            field("busy"),
                            field("processed"),
                            field("succeeded"),
                            field("retried"),
                            field("failed"),
                            field("timed_out"),
                        ),
                    );
                }
            }
        }
        _ => output::print_item(&workers, format),
    }

    Ok(())
}
