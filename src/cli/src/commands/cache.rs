//! Cache read command.
//!
//! Fresh results print as-is. Otherwise the server schedules a computation
//! and the last known result, if any, is shown as stale.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::parse_params;
use super::submit::JobKey;
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct CacheArgs {
    /// Entity (dataset) id
    entity: String,

    /// Job type wire name, e.g. /first-rows
    job_type: String,

    /// Job parameters as a JSON object
    #[arg(short, long)]
    params: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: JobKey,
    outcome: serde_json::Value,
    revision: u64,
    runner_version: u32,
    attempts: u32,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheResponse {
    fresh: bool,
    #[serde(default)]
    entry: Option<CacheEntry>,
    #[serde(default)]
    job_id: Option<Uuid>,
}

pub async fn execute(args: CacheArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let params = serde_json::to_string(&parse_params(args.params.as_deref())?)?;
    let query = [
        ("entity", args.entity.as_str()),
        ("job_type", args.job_type.as_str()),
        ("params", params.as_str()),
    ];
    let response: CacheResponse = client.get("/cache", &query).await?;

    match format {
        OutputFormat::Table => {
            if let Some(job_id) = response.job_id {
                output::print_info(&format!("Computation scheduled as job {}", job_id));
            }
            let Some(entry) = &response.entry else {
                output::print_warning("No result cached yet");
                return Ok(());
            };

            output::print_header(if response.fresh { "Result" } else { "Result (stale)" });
            output::print_detail("Entity", &entry.key.entity_id);
            output::print_detail("Job type", &entry.key.job_type);
            output::print_detail("Revision", entry.revision);
            output::print_detail("Runner version", entry.runner_version);
            output::print_detail("Attempts", entry.attempts);
            output::print_detail("Updated", entry.updated_at.to_rfc3339());
            println!();
            output::print_item(&entry.outcome, format)
        }
        _ => output::print_item(&response, format),
    }
}
