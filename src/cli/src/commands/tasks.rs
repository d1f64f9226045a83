//! Task catalogue command.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Deserialize, Serialize)]
struct TaskInfo {
    type_name: String,
    queue: String,
    max_retries: u32,
    retry_delay_secs: u64,
    soft_timeout_secs: u64,
    hard_timeout_secs: u64,
}

#[derive(Debug, Serialize, Tabled)]
struct TaskRow {
    #[tabled(rename = "Type")]
    type_name: String,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Retries")]
    max_retries: u32,
    #[tabled(rename = "Delay (s)")]
    retry_delay_secs: u64,
    #[tabled(rename = "Soft/Hard (s)")]
    limits: String,
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let mut tasks: Vec<TaskInfo> = client.get("/api/v1/tasks").await?;
    tasks.sort_by(|a, b| a.type_name.cmp(&b.type_name));

    match format {
        OutputFormat::Table => {
            let rows: Vec<TaskRow> = tasks
                .into_iter()
                .map(|t| TaskRow {
                    limits: format!("{}/{}", t.soft_timeout_secs, t.hard_timeout_secs),
                    type_name: t.type_name,
                    queue: t.queue,
                    max_retries: t.max_retries,
                    retry_delay_secs: t.retry_delay_secs,
                })
                .collect();
            output::print_list(&rows, format);
        }
        _ => output::print_item(&tasks, format),
    }

    Ok(())
}
