//! Database-notify transport over PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! One `LISTEN` per logical channel; the tenant travels in the envelope only.
//! Payloads are capped at 8000 bytes by the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgExecutor, PgListener};

use crate::config::TransportBackend;
use crate::postgres::PostgresPool;
use crate::resilience::{BackoffConfig, ExponentialBackoff, ListenerHealth};

use super::{
    ChannelNaming, Envelope, EventHandler, Listener, ListenerConnection, ListenerConnector,
    ListenerLifecycle, RawMessage, SubscriptionSet, Transport, TransportError,
    NOTIFY_PAYLOAD_LIMIT,
};

const BACKEND: &str = "postgres";

const NOTIFY_SQL: &str = "SELECT pg_notify($1, $2)";

/// Encode the notify payload, refusing envelopes over the server limit.
pub fn prepare_notification(
    payload: Value,
    tenant_id: Option<&str>,
) -> Result<String, TransportError> {
    Envelope::new(payload, tenant_id).encode_bounded(NOTIFY_PAYLOAD_LIMIT)
}

/// Notify on a caller-supplied executor, e.g. a producer's connection right
/// after its transaction committed.
pub async fn notify_with<'e, E>(
    executor: E,
    channel: &str,
    payload: Value,
    tenant_id: Option<&str>,
) -> Result<(), TransportError>
where
    E: PgExecutor<'e>,
{
    let encoded = prepare_notification(payload, tenant_id)?;
    sqlx::query(NOTIFY_SQL)
        .bind(channel)
        .bind(encoded)
        .execute(executor)
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;
    Ok(())
}

pub struct PostgresTransport {
    pool: PostgresPool,
    backoff: BackoffConfig,
    subscriptions: SubscriptionSet,
    health: Arc<ListenerHealth>,
    lifecycle: ListenerLifecycle,
}

impl PostgresTransport {
    pub fn new(pool: PostgresPool, backoff: BackoffConfig, stop_timeout: Duration) -> Self {
        Self {
            pool,
            backoff,
            subscriptions: SubscriptionSet::new(),
            health: Arc::new(ListenerHealth::new()),
            lifecycle: ListenerLifecycle::new(stop_timeout),
        }
    }

    pub fn pool(&self) -> &PostgresPool {
        &self.pool
    }
}

#[async_trait]
impl Transport for PostgresTransport {
    fn backend(&self) -> TransportBackend {
        TransportBackend::Postgres
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let encoded = prepare_notification(payload, tenant_id).inspect_err(|e| {
            tracing::warn!(channel = %channel, tenant_id = ?tenant_id, error = %e, "Dropping event");
        })?;

        let logical = channel.to_string();
        self.pool
            .execute(move |pg| async move {
                sqlx::query(NOTIFY_SQL)
                    .bind(logical)
                    .bind(encoded)
                    .execute(&pg)
                    .await
            })
            .await
            .map_err(|e| {
                tracing::warn!(
                    channel = %channel,
                    tenant_id = ?tenant_id,
                    error = %e,
                    "pg_notify failed, event dropped"
                );
                TransportError::Unavailable(e.to_string())
            })?;

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
            NotifyConnector {
                pool: self.pool.clone(),
            },
            self.subscriptions.clone(),
            self.health.clone(),
            ExponentialBackoff::new(self.backoff.clone()),
        );

        let handle = tokio::spawn(listener.run(ctx));
        self.lifecycle.attach(handle).await;
        tracing::info!(channels = self.subscriptions.len(), "PostgreSQL listener started");
        Ok(())
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
        self.health.set_stopped();
    }

    fn health(&self) -> Arc<ListenerHealth> {
        self.health.clone()
    }

    /// Room emits stay process-local with this backend.
    fn supports_session_share(&self) -> bool {
        false
    }
}

/// Opens `LISTEN` sessions on a dedicated connection from the pool's settings.
struct NotifyConnector {
    pool: PostgresPool,
}

struct NotifySession {
    listener: PgListener,
}

fn disconnected(e: sqlx::Error) -> TransportError {
    TransportError::ListenerDisconnected(e.to_string())
}

#[async_trait]
impl ListenerConnector for NotifyConnector {
    type Connection = NotifySession;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn naming(&self) -> ChannelNaming {
        ChannelNaming::Bare
    }

    async fn connect(&self) -> Result<NotifySession, TransportError> {
        let listener = PgListener::connect_with(self.pool.pool())
            .await
            .map_err(disconnected)?;
        Ok(NotifySession { listener })
    }
}

#[async_trait]
impl ListenerConnection for NotifySession {
    async fn listen(&mut self, channel: &str) -> Result<(), TransportError> {
        self.listener.listen(channel).await.map_err(disconnected)
    }

    async fn recv(&mut self) -> Result<Option<RawMessage>, TransportError> {
        let notification = self.listener.try_recv().await.map_err(disconnected)?;
        Ok(notification.map(|n| RawMessage {
            channel: n.channel().to_string(),
            payload: n.payload().to_string(),
        }))
    }

    async fn close(&mut self) {
        if let Err(e) = self.listener.unlisten_all().await {
            tracing::debug!(error = %e, "UNLISTEN failed during shutdown");
        }
    }
}
