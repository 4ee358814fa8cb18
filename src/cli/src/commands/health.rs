//! `dsq health`: server status, backfill state and, with Postgres, pool health.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Show database pool details
    #[arg(short, long)]
    detailed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthBody {
    status: String,
    version: Option<String>,
    backfill: Option<String>,
    database: Option<DatabaseHealth>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatabaseHealth {
    connected: bool,
    latency_ms: u64,
    pool_size: u32,
    idle_connections: u32,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    // 503 still carries a health body
    let (http_status, body) = client.get_raw("/health").await?;
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&body, format);
    }

    let health: HealthBody = serde_json::from_value(body)?;
    output::print_header("Server Health");
    output::print_detail("API URL", client.base_url());
    output::print_detail("Status", &health.status);
    if let Some(version) = &health.version {
        output::print_detail("Version", version);
    }
    if let Some(backfill) = &health.backfill {
        output::print_detail("Backfill", backfill);
    }

    match &health.database {
        None => output::print_detail("Store", "in-memory"),
        Some(db) => {
            output::print_detail("Store", "postgres");
            if args.detailed {
                output::print_header("Database");
                output::print_detail("Connected", db.connected);
                output::print_detail("Latency (ms)", db.latency_ms);
                output::print_detail("Pool size", db.pool_size);
                output::print_detail("Idle", db.idle_connections);
            }
        }
    }

    if http_status.is_success() && health.status == "healthy" {
        output::print_success("Server is healthy");
        Ok(())
    } else {
        anyhow::bail!("server reported {} (HTTP {})", health.status, http_status)
    }
}
