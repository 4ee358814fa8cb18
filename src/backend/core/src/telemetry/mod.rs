//! Logging, Prometheus metrics and the autoscaler depth signal.
//!
//! [`init_telemetry`] installs the metrics recorder before the subscriber so
//! that startup logs and the first gauges land in the same process state.

pub mod autoscaler;
pub mod logging;
pub mod metrics;

pub use autoscaler::{AutoscalerConfig, QueueDepthEmitter};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{
    init_metrics, BackfillMetrics, MaintenanceMetrics, MetricsConfig, MetricsRegistry,
    QueueMetrics,
};

use serde::Deserialize;

/// `[observability]` section of the config.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Value of the `service` label on every series
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// `development` switches JSON logs to the pretty format
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "dsq".to_string()
}

fn default_environment() -> String {
    std::env::var("DSQ_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Install the recorder and the subscriber. Call once per process.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<MetricsRegistry> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging, &config.environment)?;
    ::tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        metrics_enabled = config.metrics.enabled,
        "Telemetry initialized"
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "dsq");
        assert!(config.metrics.enabled);
        assert!(!config.logging.span_timings);
    }
}
