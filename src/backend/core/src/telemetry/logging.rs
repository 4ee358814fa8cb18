//! Structured logging through `tracing-subscriber`.
//!
//! Dispatcher, cache and backfill events share the field names `job_type`,
//! `entity`, `worker_size` and `attempt`, so one unit of work can be followed
//! from enqueue to cache write.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Noisy dependencies capped unless a directive says otherwise.
const QUIET_TARGETS: [(&str, &str); 3] = [("sqlx", "warn"), ("redis", "warn"), ("hyper", "warn")];

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Base filter directive, e.g. `info` or `info,dsq_core::jobs=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Extra `target = level` directives
    #[serde(default)]
    pub module_levels: BTreeMap<String, String>,

    /// Emit an event when a span closes, with its busy and idle time.
    /// Useful to time claims and reports.
    #[serde(default)]
    pub span_timings: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: BTreeMap::new(),
            span_timings: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

impl LoggingConfig {
    /// Base level, quiet dependency targets, then configured module levels.
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)?;
        for (target, level) in QUIET_TARGETS {
            if !self.level.contains(target) && !self.module_levels.contains_key(target) {
                filter = filter.add_directive(format!("{}={}", target, level).parse()?);
            }
        }
        for (target, level) in &self.module_levels {
            filter = filter.add_directive(format!("{}={}", target, level).parse()?);
        }
        Ok(filter)
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_timings {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// In development the JSON default is swapped for the pretty format.
    fn effective_format(&self, environment: &str) -> LogFormat {
        match (environment, self.format) {
            ("development", LogFormat::Json) => LogFormat::Pretty,
            (_, format) => format,
        }
    }

    fn fmt_layer(&self, environment: &str) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer().with_span_events(self.span_events()).with_target(true);
        match self.effective_format(environment) {
            LogFormat::Json => layer.json().with_current_span(true).boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if a directive does not parse or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let filter = config.env_filter()?;
    tracing_subscriber::registry()
        .with(config.fmt_layer(environment))
        .with(filter)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_prefers_pretty() {
        let config = LoggingConfig::default();
        assert_eq!(config.effective_format("development"), LogFormat::Pretty);
        assert_eq!(config.effective_format("production"), LogFormat::Json);

        let compact = LoggingConfig {
            format: LogFormat::Compact,
            ..Default::default()
        };
        assert_eq!(compact.effective_format("development"), LogFormat::Compact);
    }

    #[test]
    fn test_env_filter_with_module_levels() {
        let mut config = LoggingConfig {
            level: "info".to_string(),
            ..Default::default()
        };
        config
            .module_levels
            .insert("dsq_core::jobs::dispatcher".to_string(), "debug".to_string());
        assert!(config.env_filter().is_ok());

        config.module_levels.insert("sqlx".to_string(), "not-a-level".to_string());
        assert!(config.env_filter().is_err());
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let format: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(format, LogFormat::Compact);
    }
}
