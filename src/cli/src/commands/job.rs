//! Job commands: submit, status and wait.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::config;
use crate::client::{ApiClient, ApiError};
use crate::output::{self, OutputFormat};

const DEFAULT_WAIT_SECS: u64 = 300;

#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit a job
    Submit {
        /// Registered task type, e.g. tts.generate
        type_name: String,

        /// Inline JSON payload
        #[arg(short, long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// Read the JSON payload from a file
        #[arg(long)]
        payload_file: Option<String>,

        /// Wait for the job to finish
        #[arg(short, long)]
        wait: bool,
    },

    /// Show the current result of a job
    Status {
        job_id: Uuid,
    },

    /// Poll until a job completes or fails
    Wait {
        job_id: Uuid,

        /// Give up after this many seconds (default: wait-timeout-secs or 300)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Milliseconds between polls
        #[arg(long, default_value = "500")]
        interval: u64,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SubmitJobRequest {
    type_name: String,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize, Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
    queue: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobResult {
    job_id: Uuid,
    type_name: String,
    status: String,
    attempts: u32,
    #[serde(default)]
    return_value: Option<serde_json::Value>,
    #[serde(default)]
    error_detail: Option<String>,
    updated_at: String,
    expires_at: String,
}

impl JobResult {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed")
    }
}

fn parse_payload(inline: Option<String>, file: Option<String>) -> Result<serde_json::Value> {
    let text = match (inline, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file: {}", path))?,
        (None, None) => return Ok(serde_json::json!({})),
    };
    let payload: serde_json::Value = serde_json::from_str(&text).context("Payload is not valid JSON")?;
    if !payload.is_object() {
        anyhow::bail!("Payload must be a JSON object");
    }
    Ok(payload)
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Submit {
            type_name,
            payload,
            payload_file,
            wait,
        } => {
            let body = SubmitJobRequest {
                type_name: type_name.clone(),
                payload: parse_payload(payload, payload_file)?,
            };
            let resp: SubmitJobResponse = client.post("/api/v1/jobs", &body).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job submitted: {}", type_name));
                    output::print_detail("Job ID", &resp.job_id.to_string());
                    output::print_detail("Queue", &resp.queue);
                }
                _ => output::print_item(&resp, format),
            }

            if wait {
                let result = wait_for(client, resp.job_id, wait_timeout(None), Duration::from_millis(500)).await?;
                print_result(&result, format);
            }
        }

        JobCommands::Status { job_id } => {
            let result = lookup(client, job_id).await?;
            print_result(&result, format);
        }

        JobCommands::Wait {
            job_id,
            timeout,
            interval,
        } => {
            let result = wait_for(
                client,
                job_id,
                wait_timeout(timeout),
                Duration::from_millis(interval.max(50)),
            )
            .await?;
            print_result(&result, format);
            if result.status == "failed" {
                anyhow::bail!("Job {} failed", job_id);
            }
        }
    }

    Ok(())
}

/// Fetch a job result; a 404 means the id is unknown or its result expired.
async fn lookup(client: &ApiClient, job_id: Uuid) -> Result<JobResult> {
    client
        .get(&format!("/api/v1/jobs/{}", job_id))
        .await
        .map_err(|e| match e.downcast_ref::<ApiError>() {
            Some(api) if api.is_not_found() => {
                anyhow::anyhow!("Job {} not found (unknown id or result expired)", job_id)
            }
            _ => e,
        })
}

fn wait_timeout(flag: Option<u64>) -> Duration {
    let secs = flag
        .or_else(|| config::load_value(config::WAIT_TIMEOUT_KEY).and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_WAIT_SECS);
    Duration::from_secs(secs)
}

async fn wait_for(client: &ApiClient, job_id: Uuid, timeout: Duration, interval: Duration) -> Result<JobResult> {
    let started = Instant::now();
    let mut last_status = String::new();
    loop {
        let result = lookup(client, job_id).await?;
        if result.is_terminal() {
            return Ok(result);
        }
        if result.status != last_status {
            output::print_info(&format!("{} (attempt {})", result.status, result.attempts));
            last_status = result.status.clone();
        }
        if started.elapsed() >= timeout {
            anyhow::bail!("Timed out after {}s waiting for job {}", timeout.as_secs(), job_id);
        }
        tokio::time::sleep(interval).await;
    }
}

fn print_result(result: &JobResult, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Job: {}", result.job_id));
            output::print_detail("Type", &result.type_name);
            output::print_detail("Status", &output::status_colored(&result.status).to_string());
            output::print_detail("Attempts", &result.attempts.to_string());
            output::print_detail("Updated", &result.updated_at);
            output::print_detail("Expires", &result.expires_at);
            if let Some(error) = &result.error_detail {
                output::print_detail("Error", error);
            }
            if let Some(value) = &result.return_value {
                output::print_detail("Result", &value.to_string());
            }
        }
        _ => output::print_item(result, format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_payload_is_empty_object() {
        assert_eq!(parse_payload(None, None).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn test_inline_payload() {
        let payload = parse_payload(Some(r#"{"text":"hi"}"#.into()), None).unwrap();
        assert_eq!(payload["text"], "hi");
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        assert!(parse_payload(Some("[1,2]".into()), None).is_err());
        assert!(parse_payload(Some("not json".into()), None).is_err());
    }

    #[test]
    fn test_payload_file() {
        let dir = std::env::temp_dir().join(format!("visionary-cli-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.json");
        std::fs::write(&path, r#"{"file_id":"abc"}"#).unwrap();

        let payload = parse_payload(None, Some(path.to_string_lossy().into_owned())).unwrap();
        assert_eq!(payload["file_id"], "abc");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
