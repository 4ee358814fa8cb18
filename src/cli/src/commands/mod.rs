//! Subcommands.

pub mod backfill;
pub mod cache;
pub mod depth;
pub mod health;
pub mod invalidate;
pub mod submit;

use anyhow::{Context, Result};

/// Parse `--params` as a JSON object; absent means no parameters.
pub(crate) fn parse_params(raw: Option<&str>) -> Result<serde_json::Value> {
    let Some(raw) = raw else {
        return Ok(serde_json::json!({}));
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--params must be a JSON object")?;
    if !value.is_object() {
        anyhow::bail!("--params must be a JSON object, got {}", raw);
    }
    Ok(value)
}
