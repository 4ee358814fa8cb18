//! dsq CLI - Command-line interface for the dsq job queue and results cache.
//!
//! Talks to a running `dsq-server` over HTTP.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{backfill, cache, depth, health, invalidate, submit};
use output::OutputFormat;

/// dsq - dataset processing job queue CLI
#[derive(Parser)]
#[command(
    name = "dsq",
    version,
    about = "dsq - dataset processing job queue",
    long_about = "Submit jobs, read cached results, invalidate entities and run backfills \
                  against a dsq server.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "DSQ_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Submit(submit::SubmitArgs),

    /// Read a cached result, scheduling it when missing or stale
    Cache(cache::CacheArgs),

    /// Mark every cached result of an entity stale
    Invalidate(invalidate::InvalidateArgs),

    /// Re-enqueue retryable (and optionally stale or missing) results
    Backfill(backfill::BackfillArgs),

    /// Show waiting jobs per job type and worker size
    Depth(depth::DepthArgs),

    /// Check server health
    Health(health::HealthArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let client = client::ApiClient::new(&cli.api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Submit(args) => submit::execute(args, &client, format).await,
        Commands::Cache(args) => cache::execute(args, &client, format).await,
        Commands::Invalidate(args) => invalidate::execute(args, &client, format).await,
        Commands::Backfill(args) => backfill::execute(args, &client, format).await,
        Commands::Depth(args) => depth::execute(args, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
