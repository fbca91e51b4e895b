//! Prometheus Metrics Module
//!
//! Exposes client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: chunks received, messages by kind, protocol errors
//! - **Connection**: state, reconnect attempts, heartbeats echoed
//! - **Subscriptions**: active subscriptions by kind
//! - **Dispatch**: callback panics and dispatch latency
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder, so
//! the library can be embedded without a Prometheus exporter.
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::subscription::SubscriptionCounts;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns a [`BuildError`] if another global recorder is already
/// installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Inbound traffic
    describe_counter!(
        "quote_stream_frames_received_total",
        "Text chunks received from the streaming service"
    );
    describe_counter!(
        "quote_stream_messages_total",
        "Decoded messages by kind"
    );
    describe_counter!(
        "quote_stream_protocol_errors_total",
        "Frames dropped as malformed"
    );
    describe_counter!(
        "quote_stream_heartbeats_echoed_total",
        "Server heartbeats echoed back"
    );

    // Connection
    describe_gauge!(
        "quote_stream_connected",
        "1 while the connection is in the Connected state"
    );
    describe_counter!(
        "quote_stream_reconnects_total",
        "Reconnection attempts"
    );
    describe_histogram!(
        "quote_stream_ping_seconds",
        "Round trip of a client heartbeat"
    );

    // Subscriptions
    describe_gauge!(
        "quote_stream_subscriptions",
        "Subscriptions by kind"
    );

    // Dispatch
    describe_counter!(
        "quote_stream_callback_panics_total",
        "Consumer callbacks that panicked"
    );
    describe_histogram!(
        "quote_stream_dispatch_seconds",
        "Time to apply one message to the cache"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one inbound text chunk.
pub fn record_frame_received() {
    counter!("quote_stream_frames_received_total").increment(1);
}

/// Record a decoded message of the given kind.
pub fn record_message(kind: &'static str) {
    counter!("quote_stream_messages_total", "kind" => kind).increment(1);
}

/// Record a dropped frame.
pub fn record_protocol_error(error_type: &'static str) {
    counter!("quote_stream_protocol_errors_total", "error_type" => error_type).increment(1);
}

/// Record an echoed heartbeat.
pub fn record_heartbeat_echoed() {
    counter!("quote_stream_heartbeats_echoed_total").increment(1);
}

/// Update the connected gauge.
pub fn set_connected(connected: bool) {
    gauge!("quote_stream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("quote_stream_reconnects_total").increment(1);
}

/// Record one measured round trip.
pub fn record_ping(latency: Duration) {
    histogram!("quote_stream_ping_seconds").record(latency.as_secs_f64());
}

/// Update subscription gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(counts: SubscriptionCounts) {
    gauge!("quote_stream_subscriptions", "kind" => "quote").set(counts.quotes as f64);
    gauge!("quote_stream_subscriptions", "kind" => "chart").set(counts.charts as f64);
    gauge!("quote_stream_subscriptions", "kind" => "study").set(counts.studies as f64);
}

/// Record callbacks that panicked during one delivery.
pub fn record_callback_panics(count: usize) {
    if count > 0 {
        counter!("quote_stream_callback_panics_total").increment(count as u64);
    }
}

/// Record how long one message took to apply.
pub fn record_dispatch_duration(kind: &'static str, duration: Duration) {
    histogram!("quote_stream_dispatch_seconds", "kind" => kind).record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_frame_received();
        record_message("quote");
        record_protocol_error("length_mismatch");
        record_callback_panics(2);
        set_subscriptions(SubscriptionCounts {
            quotes: 2,
            charts: 1,
            studies: 0,
        });
        set_connected(true);
        record_ping(Duration::from_millis(12));
    }

    #[test]
    fn init_is_idempotent() {
        let first = init_metrics().unwrap();
        record_reconnect();
        let second = init_metrics().unwrap();
        assert!(second.render().contains("quote_stream_reconnects_total"));
        drop(first);
        assert!(get_metrics_handle().is_some());
    }
}
