use serde::Deserialize;

use crate::types::HumanDuration;

/// Scheduler metrics settings.
///
/// Counters are always collected; this section only controls the periodic
/// summary log and the Prometheus exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_interval")]
    pub report_interval: HumanDuration,
    #[serde(default = "default_prometheus_listen")]
    pub prometheus_listen: String,
}

fn default_report_interval() -> HumanDuration {
    HumanDuration::from_millis(10_000)
}

fn default_prometheus_listen() -> String {
    "127.0.0.1:9902".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_interval: default_report_interval(),
            prometheus_listen: default_prometheus_listen(),
        }
    }
}
