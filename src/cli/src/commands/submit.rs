//! Job submission command.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::parse_params;
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct SubmitArgs {
    /// Entity (dataset) id
    entity: String,

    /// Job type wire name, e.g. /splits
    job_type: String,

    /// Job parameters as a JSON object
    #[arg(short, long)]
    params: Option<String>,

    /// Dispatch priority (higher runs first)
    #[arg(long)]
    priority: Option<i32>,

    /// Recompute even if the cached result is up to date
    #[arg(long)]
    force: bool,
}

#[derive(Serialize)]
struct SubmitRequest {
    entity: String,
    job_type: String,
    parameters: serde_json::Value,
    priority: Option<i32>,
    force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobKey {
    pub entity_id: String,
    pub job_type: String,
    pub fingerprint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Enqueue {
    pub result: String,
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitResult {
    key: JobKey,
    worker_size: String,
    priority: i32,
    enqueue: Enqueue,
}

pub async fn execute(args: SubmitArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let request = SubmitRequest {
        parameters: parse_params(args.params.as_deref())?,
        entity: args.entity,
        job_type: args.job_type,
        priority: args.priority,
        force: args.force,
    };
    let result: SubmitResult = client.post("/jobs", &request).await?;

    match format {
        OutputFormat::Table => {
            if result.enqueue.result == "created" {
                output::print_success(&format!("Job {} enqueued", result.enqueue.job_id));
            } else {
                output::print_info(&format!(
                    "Job {} was already pending",
                    result.enqueue.job_id
                ));
            }
            output::print_detail("Entity", &result.key.entity_id);
            output::print_detail("Job type", &result.key.job_type);
            output::print_detail("Fingerprint", &result.key.fingerprint);
            output::print_detail("Worker size", &result.worker_size);
            output::print_detail("Priority", result.priority);
            Ok(())
        }
        _ => output::print_item(&result, format),
    }
}
