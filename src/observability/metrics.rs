//! # Metrics Collection
//!
//! Backend operation and plugin launch metrics, with an optional Prometheus exporter.

use std::net::SocketAddr;
use std::time::Duration;

use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::ObservabilityConfig;
use crate::errors::{DbError, Result};

/// Metrics recorder for backend and plugin activity
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record one lifecycle operation against a backend
    pub fn record_backend_operation(
        &self,
        family: &str,
        operation: &str,
        status: &str,
        duration: Duration,
    ) {
        let labels = [
            ("family", family.to_string()),
            ("operation", operation.to_string()),
            ("status", status.to_string()),
        ];
        counter!("dbplugin_operations_total", &labels).increment(1);

        let duration_labels = [("family", family.to_string()), ("operation", operation.to_string())];
        histogram!("dbplugin_operation_duration_seconds", &duration_labels)
            .record(duration.as_secs_f64());
    }

    /// Record a plugin launch outcome
    pub fn record_plugin_launch(&self, protocol: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };
        let labels = [("protocol", protocol.to_string()), ("status", status.to_string())];
        counter!("dbplugin_plugin_launches_total", &labels).increment(1);
        histogram!("dbplugin_plugin_launch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a fallback from the current protocol to the legacy one
    pub fn record_protocol_fallback(&self) {
        counter!("dbplugin_protocol_fallbacks_total").increment(1);
    }

    /// Register metric descriptions with the installed recorder
    pub fn register_metrics(&self) {
        describe_counter!(
            "dbplugin_operations_total",
            Unit::Count,
            "Backend lifecycle operations grouped by family, operation and outcome"
        );
        describe_histogram!(
            "dbplugin_operation_duration_seconds",
            Unit::Seconds,
            "Backend lifecycle operation latency"
        );
        describe_counter!(
            "dbplugin_plugin_launches_total",
            Unit::Count,
            "Plugin launches grouped by negotiated protocol and outcome"
        );
        describe_histogram!(
            "dbplugin_plugin_launch_duration_seconds",
            Unit::Seconds,
            "Time from checksum verification to a negotiated protocol"
        );
        describe_counter!(
            "dbplugin_protocol_fallbacks_total",
            Unit::Count,
            "Launches that fell back to the legacy protocol"
        );
    }
}

/// Install the Prometheus exporter when metrics are enabled.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        DbError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| DbError::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}
