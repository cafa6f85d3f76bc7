//! Gateway observability metrics
//!
//! Prometheus-compatible metrics for tunnel lifecycle, client cache and
//! per-operation outcomes.

use std::time::Duration;

/// Record a tunnel successfully established
pub fn record_tunnel_established(cluster_id: &str) {
    metrics::counter!(
        "searchdeck_tunnel_established_total",
        "cluster" => cluster_id.to_string(),
    )
    .increment(1);
}

/// Record a failed tunnel establish attempt
pub fn record_tunnel_failed(cluster_id: &str, reason: &str) {
    metrics::counter!(
        "searchdeck_tunnel_failures_total",
        "cluster" => cluster_id.to_string(),
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record a tunnel teardown
pub fn record_tunnel_closed(cluster_id: &str, reason: &str) {
    metrics::counter!(
        "searchdeck_tunnel_closed_total",
        "cluster" => cluster_id.to_string(),
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record the number of live tunnels
pub fn record_active_tunnels(count: usize) {
    metrics::gauge!("searchdeck_tunnels_active").set(count as f64);
}

/// Record a search client constructed
pub fn record_client_created(cluster_id: &str) {
    metrics::counter!(
        "searchdeck_clients_created_total",
        "cluster" => cluster_id.to_string(),
    )
    .increment(1);
}

/// Record the number of cached clients
pub fn record_client_cache_size(count: usize) {
    metrics::gauge!("searchdeck_clients_cached").set(count as f64);
}

/// Record a gateway operation that succeeded
pub fn record_operation_success(operation: &str, cluster_id: &str) {
    metrics::counter!(
        "searchdeck_operations_total",
        "operation" => operation.to_string(),
        "cluster" => cluster_id.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record a gateway operation that failed
pub fn record_operation_error(operation: &str, cluster_id: &str, error_type: &str) {
    metrics::counter!(
        "searchdeck_operations_total",
        "operation" => operation.to_string(),
        "cluster" => cluster_id.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "searchdeck_operation_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record gateway operation duration
pub fn record_operation_duration(operation: &str, duration: Duration) {
    metrics::histogram!(
        "searchdeck_operation_duration_seconds",
        "operation" => operation.to_string(),
    )
    .record(duration.as_secs_f64());
}
