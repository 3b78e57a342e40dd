//! Prometheus metrics for the operator

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{OperatorError, Result};

lazy_static::lazy_static! {
    /// Total inspection ticks
    pub static ref INSPECTIONS: CounterVec = register_counter_vec!(
        "dbcluster_operator_inspections_total",
        "Total number of pod inspection ticks",
        &["deployment", "result"]
    ).unwrap();

    /// Inspection tick duration
    pub static ref INSPECTION_DURATION: HistogramVec = register_histogram_vec!(
        "dbcluster_operator_inspection_duration_seconds",
        "Duration of pod inspection ticks",
        &["deployment"]
    ).unwrap();

    /// Pods seen by the last tick
    pub static ref INSPECTED_PODS: GaugeVec = register_gauge_vec!(
        "dbcluster_operator_inspected_pods",
        "Number of pods inspected in the last tick",
        &["deployment"]
    ).unwrap();

    /// Terminated member containers
    pub static ref CONTAINER_RESTARTS: CounterVec = register_counter_vec!(
        "dbcluster_operator_member_container_restarts_total",
        "Member container terminations by exit code and reason",
        &["deployment", "member", "container", "reason", "exit_code"]
    ).unwrap();

    /// Cluster health fetches
    pub static ref HEALTH_FETCHES: CounterVec = register_counter_vec!(
        "dbcluster_operator_health_fetches_total",
        "Cluster health refreshes",
        &["deployment", "result"]
    ).unwrap();

    /// Finalizers released
    pub static ref FINALIZERS_REMOVED: CounterVec = register_counter_vec!(
        "dbcluster_operator_finalizers_removed_total",
        "Finalizers removed from pods and volume claims",
        &["deployment", "finalizer"]
    ).unwrap();

    /// Members taken out of the topology
    pub static ref MEMBERS_REMOVED: CounterVec = register_counter_vec!(
        "dbcluster_operator_members_removed_total",
        "Members removed by the stale member reclaimer",
        &["deployment", "group"]
    ).unwrap();

    /// Operator errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "dbcluster_operator_errors_total",
        "Total number of errors",
        &["type"]
    ).unwrap();
}

/// Run the metrics server
pub async fn run_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| OperatorError::Internal(format!("metrics bind: {}", e)))?;
    info!(port = %port, "Metrics server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let metrics = encoder.encode_to_string(&metric_families).unwrap_or_default();

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics.len(),
                    metrics
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}

/// Record a completed inspection tick
pub fn record_inspection(deployment: &str, ok: bool, pods: usize, duration_secs: f64) {
    let result = if ok { "success" } else { "failure" };
    INSPECTIONS.with_label_values(&[deployment, result]).inc();
    INSPECTION_DURATION
        .with_label_values(&[deployment])
        .observe(duration_secs);
    if ok {
        INSPECTED_PODS.with_label_values(&[deployment]).set(pods as f64);
    }
}

/// Record a terminated member container
pub fn record_container_restart(
    deployment: &str,
    member: &str,
    container: &str,
    reason: &str,
    exit_code: i32,
) {
    CONTAINER_RESTARTS
        .with_label_values(&[deployment, member, container, reason, &exit_code.to_string()])
        .inc();
}

/// Record a cluster health refresh
pub fn record_health_fetch(deployment: &str, ok: bool) {
    let result = if ok { "success" } else { "failure" };
    HEALTH_FETCHES.with_label_values(&[deployment, result]).inc();
}

/// Record released finalizers
pub fn record_finalizers_removed(deployment: &str, finalizers: &[String]) {
    for f in finalizers {
        FINALIZERS_REMOVED.with_label_values(&[deployment, f]).inc();
    }
}

/// Record a reclaimed member
pub fn record_member_removed(deployment: &str, group: &str) {
    MEMBERS_REMOVED.with_label_values(&[deployment, group]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
