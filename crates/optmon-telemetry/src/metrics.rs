//! Prometheus metrics for the option position monitor.
//!
//! Covers:
//! - Streaming channel health (connected, reconnects, permanent failures)
//! - Tick decoding and malformed frames
//! - Order-status updates and dropped session events
//! - Position exits and reconciliation
//! - Monitor cycle duration
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, which must crash at startup. These panics
//! only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram,
    register_int_gauge, Counter, CounterVec, GaugeVec, Histogram, IntGauge,
};

/// Streaming channel state (1 = connected, 0 = disconnected).
/// Labels: channel (market_data/order_status)
pub static WS_CONNECTED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "optmon_ws_connected",
        "Streaming channel connection state (1=connected)",
        &["channel"]
    )
    .unwrap()
});

/// Total reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optmon_ws_reconnect_total",
        "Total streaming reconnection attempts",
        &["channel"]
    )
    .unwrap()
});

/// Channels that exhausted their reconnect attempts.
pub static WS_PERMANENT_FAILURE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optmon_ws_permanent_failure_total",
        "Streaming channels given up after max reconnect attempts",
        &["channel"]
    )
    .unwrap()
});

/// Decoded ticks by mode.
pub static TICKS_DECODED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optmon_ticks_decoded_total",
        "Total market-data ticks decoded",
        &["mode"]
    )
    .unwrap()
});

/// Dropped market-data frames.
pub static FRAMES_MALFORMED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "optmon_frames_malformed_total",
        "Total malformed market-data frames dropped"
    )
    .unwrap()
});

/// Session events dropped because the consumer fell behind.
/// Labels: event (tick/order_update/channel_state)
pub static EVENTS_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optmon_events_dropped_total",
        "Total streaming events dropped on a full event queue",
        &["event"]
    )
    .unwrap()
});

/// Order-status updates by code.
pub static ORDER_UPDATES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optmon_order_updates_total",
        "Total order-status updates received",
        &["code"]
    )
    .unwrap()
});

/// Positions currently tracked.
pub static ACTIVE_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("optmon_active_positions", "Open positions in the store").unwrap()
});

/// Completed exits by reason.
pub static EXITS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "optmon_exits_total",
        "Total positions exited",
        &["reason"]
    )
    .unwrap()
});

/// Exit attempts that reverted the position to ACTIVE.
pub static EXIT_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "optmon_exit_failures_total",
        "Total exit attempts that failed and were reverted"
    )
    .unwrap()
});

/// Positions removed by reconciliation.
pub static RECONCILE_REMOVED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "optmon_reconcile_removed_total",
        "Total positions removed as externally exited"
    )
    .unwrap()
});

/// Wall time of one polling cycle.
pub static MONITOR_CYCLE_DURATION_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "optmon_monitor_cycle_duration_ms",
        "Duration of one monitor cycle in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0]
    )
    .unwrap()
});

/// Metrics helper for recording values.
pub struct Metrics;

impl Metrics {
    // ========================================================================
    // Streaming
    // ========================================================================

    /// Record a channel connected.
    pub fn ws_connected(channel: &str) {
        WS_CONNECTED.with_label_values(&[channel]).set(1.0);
    }

    /// Record a channel disconnected.
    pub fn ws_disconnected(channel: &str) {
        WS_CONNECTED.with_label_values(&[channel]).set(0.0);
    }

    /// Record a reconnection attempt.
    pub fn ws_reconnect(channel: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[channel]).inc();
    }

    pub fn ws_permanent_failure(channel: &str) {
        WS_PERMANENT_FAILURE_TOTAL
            .with_label_values(&[channel])
            .inc();
    }

    pub fn tick_decoded(mode: &str) {
        TICKS_DECODED_TOTAL.with_label_values(&[mode]).inc();
    }

    pub fn frame_malformed() {
        FRAMES_MALFORMED_TOTAL.inc();
    }

    pub fn order_update(code: &str) {
        ORDER_UPDATES_TOTAL.with_label_values(&[code]).inc();
    }

    pub fn event_dropped(event: &str) {
        EVENTS_DROPPED_TOTAL.with_label_values(&[event]).inc();
    }

    // ========================================================================
    // Positions
    // ========================================================================

    /// Set the open-position gauge.
    pub fn active_positions(count: usize) {
        ACTIVE_POSITIONS.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Record a completed exit.
    pub fn exit_completed(reason: &str) {
        EXITS_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn exit_failed() {
        EXIT_FAILURES_TOTAL.inc();
    }

    pub fn reconcile_removed() {
        RECONCILE_REMOVED_TOTAL.inc();
    }

    pub fn monitor_cycle(duration_ms: f64) {
        MONITOR_CYCLE_DURATION_MS.observe(duration_ms);
    }
}
