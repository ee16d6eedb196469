use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::events::{emit_to_room, publish_event};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    let producer = Router::new()
        .route("/events", post(publish_event))
        .route("/emit", post(emit_to_room))
        .route_layer(from_fn_with_state(state.clone(), api_key_auth));

    let operator = Router::new()
        .route("/stats", get(stats))
        .route_layer(from_fn_with_state(state, api_key_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(operator)
        .nest("/api/v1", producer)
}
