//! Failure handling shared by the transport backends.
//!
//! - `CircuitBreaker`: stops hammering a backend that keeps failing on publish
//! - `ExponentialBackoff`: delays between listener reconnection attempts
//! - `ListenerHealth`: status of the dedicated subscriber connection, read by `/health`

mod backoff;
mod circuit_breaker;
mod health;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use health::{ListenerHealth, ListenerHealthStats, ListenerStatus};

pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
