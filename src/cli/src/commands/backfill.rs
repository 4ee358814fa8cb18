//! Backfill command.
//!
//! Runs a backfill on the server and waits for its report. Without flags only
//! entries holding a retryable error are re-enqueued.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};

use super::submit::JobKey;
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args, Serialize)]
pub struct BackfillArgs {
    /// Only this job type (wire name, e.g. /splits)
    #[arg(long)]
    job_type: Option<String>,

    /// Only this entity
    #[arg(long = "entity")]
    entity_id: Option<String>,

    /// Only errors with this code, e.g. ClientConnectionError
    #[arg(long)]
    error_code: Option<String>,

    /// Also re-enqueue results made stale by invalidation or a runner upgrade
    #[arg(long)]
    include_stale: bool,

    /// Also enqueue missing children of successful results
    #[arg(long)]
    include_missing: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackfillReport {
    outcome: String,
    scanned: u64,
    enqueued: u64,
    already_pending: u64,
    #[serde(default)]
    checkpoint: Option<JobKey>,
    duration_ms: u64,
}

pub async fn execute(args: BackfillArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: BackfillReport = client.post("/admin/backfill", &args).await?;

    match format {
        OutputFormat::Table => {
            match report.outcome.as_str() {
                "completed" => output::print_success("Backfill completed"),
                "skipped" => output::print_warning("Backfill skipped: another instance holds the lock"),
                other => output::print_warning(&format!("Backfill {}", other)),
            }
            output::print_detail("Scanned", report.scanned);
            output::print_detail("Enqueued", report.enqueued);
            output::print_detail("Already pending", report.already_pending);
            output::print_detail("Duration (ms)", report.duration_ms);
            if let Some(key) = &report.checkpoint {
                output::print_detail(
                    "Resumes after",
                    format!("{}{}@{}", key.entity_id, key.job_type, key.fingerprint),
                );
            }
            Ok(())
        }
        _ => output::print_item(&report, format),
    }
}
