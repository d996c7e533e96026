//! Prometheus metrics for the event relay.
//!
//! - Session metrics (published events, transport errors, open sessions)
//! - Dispatch metrics (read, delivered, failed, acknowledged, dead-lettered)
//! - Callback API metrics (responses by status, request latency)

mod helpers;

pub use helpers::{encode_metrics, CallbackMetrics, SessionMetrics, WorkerMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "anchor_events";

lazy_static! {
    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Events accepted by a session's publish
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_published_total", METRIC_PREFIX),
        "Total events published",
        &["channel", "transport"]
    ).unwrap();

    /// Transport failures by operation
    pub static ref TRANSPORT_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_transport_errors_total", METRIC_PREFIX),
        "Total transport operation errors",
        &["channel", "operation"]
    ).unwrap();

    /// Sessions currently registered with the event service
    pub static ref SESSIONS_OPEN: IntGauge = register_int_gauge!(
        format!("{}_sessions_open", METRIC_PREFIX),
        "Number of open sessions"
    ).unwrap();

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Events returned by reads (redeliveries included)
    pub static ref EVENTS_READ_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_read_total", METRIC_PREFIX),
        "Total events read by dispatch workers",
        &["channel"]
    ).unwrap();

    /// Events the handler reported as delivered
    pub static ref EVENTS_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivered_total", METRIC_PREFIX),
        "Total events delivered by the handler",
        &["channel"]
    ).unwrap();

    /// Events the handler reported as failed
    pub static ref EVENTS_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_failed_total", METRIC_PREFIX),
        "Total event handling failures",
        &["channel"]
    ).unwrap();

    /// Events committed on the transport
    pub static ref EVENTS_ACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_acked_total", METRIC_PREFIX),
        "Total events acknowledged",
        &["channel"]
    ).unwrap();

    /// Events that exhausted their attempts
    pub static ref EVENTS_DEAD_LETTERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_dead_lettered_total", METRIC_PREFIX),
        "Total events that exceeded the maximum number of attempts",
        &["channel", "outcome"]
    ).unwrap();

    /// Handler latency per event
    pub static ref HANDLER_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_handler_latency_seconds", METRIC_PREFIX),
        "Event handler latency in seconds",
        &["channel"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Dispatch worker state (0=idle, 1=reading, 2=processing, 3=acking, 4=closed)
    pub static ref WORKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_worker_state", METRIC_PREFIX),
        "Dispatch worker state (0=idle, 1=reading, 2=processing, 3=acking, 4=closed)",
        &["channel"]
    ).unwrap();

    // ============================================================================
    // Callback API Metrics
    // ============================================================================

    /// Callback API requests by outcome
    pub static ref CALLBACK_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_callback_requests_total", METRIC_PREFIX),
        "Total callback API requests",
        &["status"]
    ).unwrap();

    /// Callback API request latency
    pub static ref CALLBACK_LATENCY: Histogram = register_histogram!(
        format!("{}_callback_latency_seconds", METRIC_PREFIX),
        "Callback API request latency in seconds",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
}
