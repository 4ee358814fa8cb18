//! Entity invalidation command.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct InvalidateArgs {
    /// Entity (dataset) id
    entity: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Invalidated {
    entity: String,
    revision: u64,
}

pub async fn execute(args: InvalidateArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    // Entity ids may contain '/', which must not split the path
    let path = format!("/entities/{}/invalidate", args.entity.replace('/', "%2F"));
    let result: Invalidated = client.post(&path, &serde_json::json!({})).await?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!(
                "{} invalidated, now at revision {}",
                result.entity, result.revision
            ));
            Ok(())
        }
        _ => output::print_item(&result, format),
    }
}
