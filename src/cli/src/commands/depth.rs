//! Queue depth command.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct DepthArgs {
    /// Include pairs with nothing waiting
    #[arg(short, long)]
    all: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueDepth {
    job_type: String,
    worker_size: String,
    waiting: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DepthReport {
    waiting: Vec<QueueDepth>,
    statuses: Vec<serde_json::Value>,
    cache: Vec<serde_json::Value>,
}

#[derive(Tabled)]
struct DepthRow {
    #[tabled(rename = "Job type")]
    job_type: String,
    #[tabled(rename = "Worker size")]
    worker_size: String,
    #[tabled(rename = "Waiting")]
    waiting: u64,
}

pub async fn execute(args: DepthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let no_query: [(&str, &str); 0] = [];
    let report: DepthReport = client.get("/queue/depth", &no_query).await?;

    let rows: Vec<DepthRow> = report
        .waiting
        .iter()
        .filter(|d| args.all || d.waiting > 0)
        .map(|d| DepthRow {
            job_type: d.job_type.clone(),
            worker_size: d.worker_size.clone(),
            waiting: d.waiting,
        })
        .collect();

    output::print_rows(&rows, &report, format)
}
