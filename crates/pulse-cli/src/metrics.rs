//! Metrics export for the subscriber.
//!
//! The client records through the `metrics` facade; this installs the
//! Prometheus exporter so those series can be scraped.

use anyhow::{Context, Result};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::config::MetricsConfig;

/// Metric names.
pub mod names {
    pub const EVENTS_PRINTED: &str = "pulse_sub_events_printed_total";
    pub const PRESENCE_CHANGES: &str = "pulse_sub_presence_changes_total";
}

/// Start the Prometheus exporter if enabled, then describe every metric.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    tenvis_pulse_client::metrics::describe();
    metrics::describe_counter!(names::EVENTS_PRINTED, "Channel events written to stdout");
    metrics::describe_counter!(names::PRESENCE_CHANGES, "Presence syncs applied");

    info!(%addr, "Metrics server listening");
    Ok(())
}

pub fn record_event(topic: &str) {
    counter!(names::EVENTS_PRINTED, "topic" => topic.to_string()).increment(1);
}

pub fn record_presence_change(topic: &str) {
    counter!(names::PRESENCE_CHANGES, "topic" => topic.to_string()).increment(1);
}
