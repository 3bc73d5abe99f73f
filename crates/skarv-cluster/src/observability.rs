//! Replication metrics.
//!
//! Lightweight metrics on the `metrics` facade with optional Prometheus
//! export. Every recording call compiles to nothing when the
//! `metrics-prometheus` feature is disabled.

use std::sync::OnceLock;
use std::time::Duration;

/// Replication-layer metrics
pub struct ReplicationMetrics;

impl ReplicationMetrics {
    // ---- Counters ----

    /// A follower was dropped from an ISR
    pub fn increment_isr_shrinks() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skarv_replication_isr_shrinks_total").increment(1);
    }

    /// A follower was added back to an ISR
    pub fn increment_isr_expands() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skarv_replication_isr_expands_total").increment(1);
    }

    /// A high watermark checkpoint was written
    pub fn increment_hw_checkpoints() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skarv_replication_hw_checkpoints_total").increment(1);
    }

    // ---- Gauges ----

    /// Partitions this broker currently leads
    pub fn set_leader_partition_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skarv_replication_leader_partitions").set(count as f64);
    }

    /// Led partitions whose ISR is smaller than their assignment
    pub fn set_under_replicated_partitions(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skarv_replication_under_replicated_partitions").set(count as f64);
    }

    // ---- Histograms ----

    /// Time spent writing one high watermark checkpoint
    pub fn record_hw_checkpoint_duration(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("skarv_replication_hw_checkpoint_seconds")
            .record(duration.as_secs_f64());
    }

    /// Time spent processing one controller state-change request
    pub fn record_state_change_duration(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("skarv_replication_state_change_seconds")
            .record(duration.as_secs_f64());
    }
}

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Start an HTTP server on `addr` serving `/metrics`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!("Prometheus metrics exporter listening on http://{addr}/metrics");
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem. Safe to call multiple times.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    #[cfg(not(feature = "metrics-prometheus"))]
    let _ = prometheus_addr;

    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("failed to start Prometheus exporter: {e}");
            }
        }

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "metrics subsystem initialized"
        );
    });
    Ok(())
}
