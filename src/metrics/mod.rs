//! Prometheus metrics for the relay.
//!
//! - Transport metrics (publishes, drops by reason, received messages by outcome)
//! - Listener metrics (status gauge, reconnects)
//! - Gateway metrics (connections, rooms, fanout, rejections)
//! - Session share metrics (routed room emits, membership refreshes)

mod helpers;

pub use helpers::{
    encode_metrics, GatewayMetrics, HeartbeatMetrics, SessionShareMetrics, TransportMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "relay";

lazy_static! {
    // ============================================================================
    // Transport Metrics
    // ============================================================================

    /// Envelopes handed to the transport successfully
    pub static ref TRANSPORT_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_transport_published_total", METRIC_PREFIX),
        "Total envelopes published",
        &["backend"]
    ).unwrap();

    /// Publishes that never reached the transport
    pub static ref TRANSPORT_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_transport_dropped_total", METRIC_PREFIX),
        "Total envelopes dropped on publish",
        &["backend", "reason"]
    ).unwrap();

    /// Messages received by the listener, by delivery outcome
    pub static ref TRANSPORT_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_transport_received_total", METRIC_PREFIX),
        "Total messages received from the transport",
        &["backend", "outcome"]
    ).unwrap();

    /// Listener status (0=idle, 1=connected, 2=reconnecting, 3=stopped)
    pub static ref LISTENER_STATUS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_listener_status", METRIC_PREFIX),
        "Listener status (0=idle, 1=connected, 2=reconnecting, 3=stopped)",
        &["backend"]
    ).unwrap();

    pub static ref LISTENER_RECONNECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_listener_reconnects_total", METRIC_PREFIX),
        "Total listener reconnection attempts",
        &["backend"]
    ).unwrap();

    // ============================================================================
    // Gateway Metrics
    // ============================================================================

    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Active WebSocket connections on this process"
    ).unwrap();

    pub static ref ROOMS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_active", METRIC_PREFIX),
        "Rooms with at least one local member"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections authenticated"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Handshakes refused, by client error code
    pub static ref WS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_rejected_total", METRIC_PREFIX),
        "Total WebSocket handshakes rejected",
        &["code"]
    ).unwrap();

    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total WebSocket messages received from clients",
        &["type"]
    ).unwrap();

    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    /// Frames queued to member connections
    pub static ref FANOUT_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_fanout_delivered_total", METRIC_PREFIX),
        "Total event frames queued to connections"
    ).unwrap();

    /// Frames dropped because a connection's buffer was full or closed
    pub static ref FANOUT_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_fanout_dropped_total", METRIC_PREFIX),
        "Total event frames dropped on slow or closed connections"
    ).unwrap();

    pub static ref FORCED_LOGOUTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_forced_logouts_total", METRIC_PREFIX),
        "Total connections closed by a logout event"
    ).unwrap();

    // ============================================================================
    // Session Share Metrics
    // ============================================================================

    pub static ref ROOM_EMITS_ROUTED: IntCounter = register_int_counter!(
        format!("{}_room_emits_routed_total", METRIC_PREFIX),
        "Total room emits published for other processes"
    ).unwrap();

    pub static ref ROOM_EMITS_FAILED: IntCounter = register_int_counter!(
        format!("{}_room_emits_failed_total", METRIC_PREFIX),
        "Total room emits the transport refused"
    ).unwrap();

    pub static ref ROOM_EMITS_RECEIVED: IntCounter = register_int_counter!(
        format!("{}_room_emits_received_total", METRIC_PREFIX),
        "Total room emits received from other processes"
    ).unwrap();

    pub static ref MEMBERSHIPS_REFRESHED: IntCounter = register_int_counter!(
        format!("{}_memberships_refreshed_total", METRIC_PREFIX),
        "Total room memberships refreshed in the shared store"
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    ).unwrap();

    pub static ref STALE_CONNECTIONS_REMOVED: IntCounter = register_int_counter!(
        format!("{}_stale_connections_removed_total", METRIC_PREFIX),
        "Total connections closed for inactivity"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        CONNECTIONS_ACTIVE.set(1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("relay_connections_active"));
    }

    #[test]
    fn test_transport_metrics() {
        TransportMetrics::record_published("memory");
        TransportMetrics::record_dropped("memory", "too_large");
        TransportMetrics::record_received("memory", "delivered");

        assert!(
            TRANSPORT_DROPPED_TOTAL
                .with_label_values(&["memory", "too_large"])
                .get()
                >= 1
        );
    }
}
