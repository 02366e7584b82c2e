//! Metrics definitions for the relay service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `reason`: fixed rejection reasons (< 10 values)
//! - `message_type`: inbound message classes (< 10 values)
//!
//! Room names are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // In-process message handling; sub-millisecond is normal
        .set_buckets_for_metric(
            Matcher::Prefix("relay_message".to_string()),
            &[
                0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `relay_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Metric: `relay_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_rooms_active").set(count as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Record an inbound message relayed to the rest of its room.
///
/// Metric: `relay_messages_relayed_total`
pub fn record_message_relayed() {
    counter!("relay_messages_relayed_total").increment(1);
}

/// Record an inbound message that was not relayed.
///
/// Metric: `relay_messages_rejected_total`
/// Labels: `reason` (rate_limited, invalid_message, bad_protocol, unknown_connection)
pub fn record_message_rejected(reason: &'static str) {
    counter!("relay_messages_rejected_total", "reason" => reason).increment(1);
}

/// Record a refused connection.
///
/// Metric: `relay_admissions_rejected_total`
/// Labels: `reason` (origin_rejected, room_full, invalid_room, directory_full, ...)
pub fn record_admission_rejected(reason: &'static str) {
    counter!("relay_admissions_rejected_total", "reason" => reason).increment(1);
}

/// Metric: `relay_room_hibernations_total`
pub fn record_room_hibernation() {
    counter!("relay_room_hibernations_total").increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Record time from frame receipt to completed handling.
///
/// Metric: `relay_message_latency_seconds`
/// Labels: `message_type` (hello, ping, relay, rate_limited, invalid, unknown)
pub fn record_message_latency(message_type: &'static str, duration: Duration) {
    histogram!("relay_message_latency_seconds", "message_type" => message_type)
        .record(duration.as_secs_f64());
}
