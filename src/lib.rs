// Shared infrastructure
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
pub mod resilience;
pub mod telemetry;

// Event distribution
pub mod channel;
pub mod router;
pub mod session_share;
pub mod tenant;
pub mod transport;

// Client-facing layer
pub mod api;
pub mod gateway;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
