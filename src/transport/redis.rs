//! Broker transport over Redis pub/sub.
//!
//! Publishing goes through the shared multiplexed [`RedisPool`]. Listening
//! uses one dedicated pub/sub connection per process that issues
//! `SUBSCRIBE {channel}` and `PSUBSCRIBE tenant-*-{channel}` for every
//! registered channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::PubSub;
use redis::AsyncCommands;
use serde_json::Value;

use crate::channel::{wire_channel, TENANT_PREFIX};
use crate::config::TransportBackend;
use crate::metrics::TransportMetrics;
use crate::redis::RedisPool;
use crate::resilience::{BackoffConfig, ExponentialBackoff, ListenerHealth};

use super::{
    ChannelNaming, Envelope, EventHandler, Listener, ListenerConnection, ListenerConnector,
    ListenerLifecycle, RawMessage, SubscriptionSet, Transport, TransportError,
};

const BACKEND: &str = "redis";

/// Pattern matching every tenant-qualified wire name of `channel`
pub fn tenant_pattern(channel: &str) -> String {
    format!("{}*-{}", TENANT_PREFIX, channel)
}

pub struct RedisTransport {
    pool: Arc<RedisPool>,
    backoff: BackoffConfig,
    max_envelope_bytes: Option<usize>,
    subscriptions: SubscriptionSet,
    health: Arc<ListenerHealth>,
    lifecycle: ListenerLifecycle,
}

impl RedisTransport {
    pub fn new(
        pool: Arc<RedisPool>,
        backoff: BackoffConfig,
        max_envelope_bytes: Option<usize>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            backoff,
            max_envelope_bytes,
            subscriptions: SubscriptionSet::new(),
            health: Arc::new(ListenerHealth::new()),
            lifecycle: ListenerLifecycle::new(stop_timeout),
        }
    }

    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn backend(&self) -> TransportBackend {
        TransportBackend::Redis
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let envelope = Envelope::new(payload, tenant_id);
        let encoded = match self.max_envelope_bytes {
            Some(limit) => envelope.encode_bounded(limit),
            None => envelope.encode(),
        }
        .inspect_err(|e| {
            tracing::warn!(channel = %channel, tenant_id = ?tenant_id, error = %e, "Dropping event");
        })?;

        let wire = wire_channel(channel, tenant_id);
        let receivers = self
            .pool
            .execute(move |mut conn| async move { conn.publish::<_, _, i64>(wire, encoded).await })
            .await
            .map_err(|e| {
                tracing::warn!(
                    channel = %channel,
                    tenant_id = ?tenant_id,
                    error = %e,
                    "Redis publish failed, event dropped"
                );
                TransportError::Unavailable(e.to_string())
            })?;

        tracing::trace!(channel = %channel, receivers, "Published to Redis");
        Ok(())
    }

    fn subscribe_all(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), TransportError> {
        self.subscriptions.register(channel, handler)?;
        self.lifecycle.request_listen(channel);
        Ok(())
    }

    async fn start(&self) -> Result<(), TransportError> {
        let ctx = self.lifecycle.begin().await?;

        let listener = Listener::new(
            PubSubConnector {
                client: self.pool.client().clone(),
            },
            self.subscriptions.clone(),
            self.health.clone(),
            ExponentialBackoff::new(self.backoff.clone()),
        );

        let handle = tokio::spawn(listener.run(ctx));
        self.lifecycle.attach(handle).await;
        tracing::info!(channels = self.subscriptions.len(), "Redis listener started");
        Ok(())
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
        self.health.set_stopped();
    }

    fn health(&self) -> Arc<ListenerHealth> {
        self.health.clone()
    }

    fn supports_session_share(&self) -> bool {
        true
    }
}

/// Opens dedicated pub/sub connections for the listener.
struct PubSubConnector {
    client: redis::Client,
}

struct PubSubSession {
    pubsub: PubSub,
}

fn disconnected(e: redis::RedisError) -> TransportError {
    TransportError::ListenerDisconnected(e.to_string())
}

#[async_trait]
impl ListenerConnector for PubSubConnector {
    type Connection = PubSubSession;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn naming(&self) -> ChannelNaming {
        ChannelNaming::Qualified
    }

    async fn connect(&self) -> Result<PubSubSession, TransportError> {
        let pubsub = self.client.get_async_pubsub().await.map_err(disconnected)?;
        Ok(PubSubSession { pubsub })
    }
}

#[async_trait]
impl ListenerConnection for PubSubSession {
    async fn listen(&mut self, channel: &str) -> Result<(), TransportError> {
        self.pubsub.subscribe(channel).await.map_err(disconnected)?;
        self.pubsub
            .psubscribe(tenant_pattern(channel))
            .await
            .map_err(disconnected)?;

        tracing::debug!(channel = %channel, "Subscribed to channel and tenant pattern");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RawMessage>, TransportError> {
        let mut messages = self.pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => return Ok(Some(RawMessage { channel, payload })),
                Err(e) => {
                    tracing::warn!(wire_channel = %channel, error = %e, "Failed to read Redis payload");
                    TransportMetrics::record_received(BACKEND, "malformed");
                }
            }
        }
        Ok(None)
    }

    /// Dropping the connection releases every subscription.
    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    #[test]
    fn test_tenant_pattern() {
        assert_eq!(tenant_pattern("task-updated"), "tenant-*-task-updated");
    }

    #[tokio::test]
    async fn test_publish_with_open_circuit_is_dropped() {
        let pool = Arc::new(RedisPool::new(&RedisConfig::default()).unwrap());
        for _ in 0..5 {
            pool.circuit_breaker().record_failure();
        }
        let transport = RedisTransport::new(
            pool,
            BackoffConfig::default(),
            None,
            Duration::from_secs(1),
        );

        let result = transport
            .publish("task-updated", serde_json::json!({}), Some("t1"))
            .await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_cap_checked_before_network() {
        let pool = Arc::new(RedisPool::new(&RedisConfig::default()).unwrap());
        let transport = RedisTransport::new(
            pool,
            BackoffConfig::default(),
            Some(64),
            Duration::from_secs(1),
        );

        let result = transport
            .publish("task-updated", serde_json::json!({"blob": "x".repeat(100)}), None)
            .await;
        assert!(matches!(result, Err(TransportError::EnvelopeTooLarge { .. })));
    }
}
