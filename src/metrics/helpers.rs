//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::session::TransportKind;

use super::{
    CALLBACK_LATENCY, CALLBACK_REQUESTS_TOTAL, EVENTS_ACKED_TOTAL, EVENTS_DEAD_LETTERED_TOTAL,
    EVENTS_DELIVERED_TOTAL, EVENTS_FAILED_TOTAL, EVENTS_PUBLISHED_TOTAL, EVENTS_READ_TOTAL,
    HANDLER_LATENCY, SESSIONS_OPEN, TRANSPORT_ERRORS_TOTAL, WORKER_STATE,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording session metrics
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record an event accepted by `publish`
    pub fn record_published(channel: &str, transport: TransportKind) {
        EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[channel, transport.as_str()])
            .inc();
    }

    /// Record a failed transport operation
    pub fn record_transport_error(channel: &str, operation: &str) {
        TRANSPORT_ERRORS_TOTAL
            .with_label_values(&[channel, operation])
            .inc();
    }

    pub fn session_opened() {
        SESSIONS_OPEN.inc();
    }

    pub fn sessions_closed(count: usize) {
        SESSIONS_OPEN.sub(count as i64);
    }
}

/// Helper struct for recording dispatch worker metrics
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn record_read(channel: &str, count: usize) {
        EVENTS_READ_TOTAL
            .with_label_values(&[channel])
            .inc_by(count as u64);
    }

    pub fn record_delivered(channel: &str, latency_secs: f64) {
        EVENTS_DELIVERED_TOTAL.with_label_values(&[channel]).inc();
        HANDLER_LATENCY
            .with_label_values(&[channel])
            .observe(latency_secs);
    }

    pub fn record_failed(channel: &str, latency_secs: f64) {
        EVENTS_FAILED_TOTAL.with_label_values(&[channel]).inc();
        HANDLER_LATENCY
            .with_label_values(&[channel])
            .observe(latency_secs);
    }

    pub fn record_acked(channel: &str, count: usize) {
        EVENTS_ACKED_TOTAL
            .with_label_values(&[channel])
            .inc_by(count as u64);
    }

    /// Record an event that exhausted its attempts (`outcome` is
    /// `dead_lettered` or `discarded`)
    pub fn record_dead_lettered(channel: &str, outcome: &str) {
        EVENTS_DEAD_LETTERED_TOTAL
            .with_label_values(&[channel, outcome])
            .inc();
    }

    pub fn set_state(channel: &str, state: u8) {
        WORKER_STATE.with_label_values(&[channel]).set(state as i64);
    }
}

/// Helper struct for recording callback API metrics
pub struct CallbackMetrics;

impl CallbackMetrics {
    /// Record a callback response; `status` is the HTTP status code or an
    /// error class such as `timeout`
    pub fn record_request(status: &str, latency_secs: f64) {
        CALLBACK_REQUESTS_TOTAL.with_label_values(&[status]).inc();
        CALLBACK_LATENCY.observe(latency_secs);
    }
}
