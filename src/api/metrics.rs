//! Prometheus metrics endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::metrics::{self, GatewayMetrics, TransportMetrics};
use crate::server::AppState;

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    refresh_gauges(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

fn refresh_gauges(state: &AppState) {
    let registry = state.gateway.registry();
    GatewayMetrics::set_active(registry.connection_count(), registry.room_count());
    TransportMetrics::set_listener_status(
        state.router.backend().as_str(),
        state.router.health().status(),
    );
}
