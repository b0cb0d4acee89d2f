use crate::error::AppError;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder. Call once from `main`;
/// counters recorded before (or without) this call are dropped.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, AppError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("failed to install metrics recorder: {}", e)))
}
