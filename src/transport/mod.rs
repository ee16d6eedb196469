//! Publish/subscribe transports behind one trait.
//!
//! | Backend | Publish | Listen | Tenant on the wire |
//! |---------|---------|--------|--------------------|
//! | `redis` | `PUBLISH` on the wire channel | `SUBSCRIBE ch` + `PSUBSCRIBE tenant-*-ch` | channel name and envelope |
//! | `postgres` | `pg_notify(ch, envelope)` | one `LISTEN ch` per logical channel | envelope only |
//! | `memory` | in-process broadcast on the wire channel | every message | channel name and envelope |
//!
//! All backends carry the same [`Envelope`]. Publishing is at-most-once: a
//! failed publish is logged and reported to whoever awaits it, never retried.

pub mod envelope;
mod lifecycle;
mod listener;
pub mod memory;
pub mod postgres;
pub mod redis;
mod subscriptions;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::{TransportBackend, TransportConfig};
use crate::postgres::PostgresPool;
use crate::redis::RedisPool;
use crate::resilience::ListenerHealth;

pub use envelope::{Envelope, NOTIFY_PAYLOAD_LIMIT};
pub use memory::{MemoryBus, MemoryTransport};
pub use postgres::{notify_with, PostgresTransport};
pub use self::redis::RedisTransport;
pub use subscriptions::{DeliveryOutcome, SubscriptionSet};

pub(crate) use lifecycle::{wait_before_reconnect, ListenerContext, ListenerLifecycle, SessionEnd};
pub(crate) use listener::{
    ChannelNaming, Listener, ListenerConnection, ListenerConnector, RawMessage,
};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Envelope of {size} bytes exceeds the {limit} byte limit")]
    EnvelopeTooLarge { size: usize, limit: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Channel {0} already has a handler")]
    DuplicateSubscription(String),

    #[error("Listener already started")]
    AlreadyStarted,

    #[error("Listener disconnected: {0}")]
    ListenerDisconnected(String),

    #[error("Malformed envelope: {0}")]
    Decode(String),

    #[error("Publish task failed: {0}")]
    TaskFailed(String),
}

impl TransportError {
    /// Short label for drop metrics
    pub fn reason(&self) -> &'static str {
        match self {
            TransportError::Unavailable(_) => "unavailable",
            TransportError::EnvelopeTooLarge { .. } => "too_large",
            TransportError::Serialization(_) => "serialization",
            TransportError::DuplicateSubscription(_) => "duplicate_subscription",
            TransportError::AlreadyStarted => "already_started",
            TransportError::ListenerDisconnected(_) => "listener_disconnected",
            TransportError::Decode(_) => "decode",
            TransportError::TaskFailed(_) => "task_failed",
        }
    }
}

/// An event received from the transport, already decoded and tenant-checked.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Logical channel
    pub channel: String,
    pub envelope: Envelope,
}

/// Receives every event published on one logical channel, for all tenants.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: InboundEvent);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn backend(&self) -> TransportBackend;

    /// Publish one envelope. Errors are for observers only; nothing is retried.
    async fn publish(
        &self,
        channel: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Register the handler for a logical channel, covering the bare channel
    /// and every tenant-qualified variant. One handler per channel.
    fn subscribe_all(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), TransportError>;

    /// Spawn the dedicated listener. Fails with `AlreadyStarted` on a second call.
    async fn start(&self) -> Result<(), TransportError>;

    /// Signal the listener and wait for it to release its connection.
    async fn stop(&self);

    fn health(&self) -> Arc<ListenerHealth>;

    /// Whether room emits can be routed to other processes through this transport.
    fn supports_session_share(&self) -> bool;
}

/// Build the configured transport. Pools are only required by their backend.
pub fn create_transport(
    config: &TransportConfig,
    redis_pool: Option<Arc<RedisPool>>,
    pg_pool: Option<PostgresPool>,
    bus: Option<MemoryBus>,
) -> Result<Arc<dyn Transport>, TransportError> {
    let stop_timeout = Duration::from_millis(config.stop_timeout_ms);

    let transport: Arc<dyn Transport> = match config.backend {
        TransportBackend::Redis => {
            let pool = redis_pool.ok_or_else(|| {
                TransportError::Unavailable("redis backend selected without a redis pool".into())
            })?;
            Arc::new(RedisTransport::new(
                pool,
                config.backoff(),
                config.max_envelope_bytes,
                stop_timeout,
            ))
        }
        TransportBackend::Postgres => {
            let pool = pg_pool.ok_or_else(|| {
                TransportError::Unavailable("postgres backend selected without a database".into())
            })?;
            Arc::new(PostgresTransport::new(pool, config.backoff(), stop_timeout))
        }
        TransportBackend::Memory => {
            let bus = bus.unwrap_or_else(|| MemoryBus::new(config.memory_capacity));
            Arc::new(MemoryTransport::new(bus, config.max_envelope_bytes, stop_timeout))
        }
    };

    tracing::info!(backend = config.backend.as_str(), "Transport created");
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_memory_transport_by_default() {
        let transport = create_transport(&TransportConfig::default(), None, None, None).unwrap();
        assert_eq!(transport.backend(), TransportBackend::Memory);
        assert!(transport.supports_session_share());
    }

    #[test]
    fn test_create_redis_without_pool_fails() {
        let config = TransportConfig {
            backend: TransportBackend::Redis,
            ..Default::default()
        };
        let result = create_transport(&config, None, None, None);
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[test]
    fn test_create_postgres_without_pool_fails() {
        let config = TransportConfig {
            backend: TransportBackend::Postgres,
            ..Default::default()
        };
        assert!(create_transport(&config, None, None, None).is_err());
    }

    #[test]
    fn test_error_reasons() {
        let err = TransportError::EnvelopeTooLarge {
            size: 9000,
            limit: 8000,
        };
        assert_eq!(err.reason(), "too_large");
        assert!(err.to_string().contains("9000"));
        assert_eq!(TransportError::Unavailable("down".into()).reason(), "unavailable");
    }
}
