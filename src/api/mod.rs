//! HTTP endpoints: health, stats, metrics and the producer API.

mod events;
mod health;
mod metrics;
mod routes;

pub use events::{emit_to_room, publish_event, EmitRequest, EmitResponse, PublishEventRequest, PublishEventResponse};
pub use health::{health, stats, HealthResponse, StatsResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
