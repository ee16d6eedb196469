use prometheus::{Encoder, TextEncoder};

use crate::resilience::ListenerStatus;

use super::{
    CONNECTIONS_ACTIVE, FANOUT_DELIVERED_TOTAL, FANOUT_DROPPED_TOTAL, FORCED_LOGOUTS_TOTAL,
    HEARTBEAT_DURATION_MS, LISTENER_RECONNECTS_TOTAL, LISTENER_STATUS, MEMBERSHIPS_REFRESHED,
    ROOMS_ACTIVE, ROOM_EMITS_FAILED, ROOM_EMITS_RECEIVED, ROOM_EMITS_ROUTED, STALE_CONNECTIONS_REMOVED,
    TRANSPORT_DROPPED_TOTAL, TRANSPORT_PUBLISHED_TOTAL, TRANSPORT_RECEIVED_TOTAL,
    WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED, WS_CONNECTION_DURATION, WS_MESSAGES_RECEIVED,
    WS_REJECTED_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct TransportMetrics;

impl TransportMetrics {
    pub fn record_published(backend: &str) {
        TRANSPORT_PUBLISHED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_dropped(backend: &str, reason: &str) {
        TRANSPORT_DROPPED_TOTAL
            .with_label_values(&[backend, reason])
            .inc();
    }

    pub fn record_received(backend: &str, outcome: &str) {
        TRANSPORT_RECEIVED_TOTAL
            .with_label_values(&[backend, outcome])
            .inc();
    }

    pub fn record_reconnect(backend: &str) {
        LISTENER_RECONNECTS_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn set_listener_status(backend: &str, status: ListenerStatus) {
        LISTENER_STATUS
            .with_label_values(&[backend])
            .set(status.as_gauge());
    }
}

pub struct GatewayMetrics;

impl GatewayMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    pub fn record_closed(duration_secs: f64) {
        WS_CONNECTIONS_CLOSED.inc();
        WS_CONNECTION_DURATION.observe(duration_secs);
    }

    pub fn record_rejected(code: &str) {
        WS_REJECTED_TOTAL.with_label_values(&[code]).inc();
    }

    pub fn record_client_message(kind: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }

    pub fn record_fanout(delivered: u64, dropped: u64) {
        FANOUT_DELIVERED_TOTAL.inc_by(delivered);
        FANOUT_DROPPED_TOTAL.inc_by(dropped);
    }

    pub fn record_forced_logout(closed: u64) {
        FORCED_LOGOUTS_TOTAL.inc_by(closed);
    }

    /// Update the registry gauges (call after membership changes)
    pub fn set_active(connections: usize, rooms: usize) {
        CONNECTIONS_ACTIVE.set(connections as i64);
        ROOMS_ACTIVE.set(rooms as i64);
    }
}

pub struct SessionShareMetrics;

impl SessionShareMetrics {
    pub fn record_routed() {
        ROOM_EMITS_ROUTED.inc();
    }

    pub fn record_failed() {
        ROOM_EMITS_FAILED.inc();
    }

    pub fn record_received() {
        ROOM_EMITS_RECEIVED.inc();
    }

    pub fn record_refreshed(count: u64) {
        MEMBERSHIPS_REFRESHED.inc_by(count);
    }
}

pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_round(duration_ms: f64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms);
    }

    pub fn record_stale_removed(count: u64) {
        STALE_CONNECTIONS_REMOVED.inc_by(count);
    }
}
