//! Coordinated shutdown.
//!
//! 1. Tell connected clients to reconnect elsewhere
//! 2. Signal background tasks to stop
//! 3. Give clients a moment to close their sockets
//! 4. Stop the router, closing the dedicated subscriber connection

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::gateway::ConnectionGateway;
use crate::router::NotificationRouter;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to wait for clients to close after the shutdown frame
    pub drain_timeout: Duration,
    /// Suggested reconnect delay sent to clients
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            reconnect_after_seconds: 5,
        }
    }
}

pub struct GracefulShutdown {
    gateway: Arc<ConnectionGateway>,
    router: Arc<NotificationRouter>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        router: Arc<NotificationRouter>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(gateway, router, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        gateway: Arc<ConnectionGateway>,
        router: Arc<NotificationRouter>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            gateway,
            router,
            shutdown_tx,
            config,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.gateway.registry().connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Graceful shutdown: notifying clients");
        result.clients_notified = self.gateway.notify_shutdown(self.config.reconnect_after_seconds);

        tracing::info!("Graceful shutdown: stopping background tasks");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Graceful shutdown: waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;

        tracing::info!("Graceful shutdown: stopping router");
        self.router.stop().await;

        result.duration = start.elapsed();
        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn wait_for_connections_to_close(&self) -> usize {
        let registry = self.gateway.registry();
        let initial = registry.connection_count();
        if initial == 0 {
            return 0;
        }

        let wait = async {
            while registry.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        let _ = timeout(self.config.drain_timeout, wait).await;

        let remaining = registry.connection_count();
        if remaining > 0 {
            tracing::warn!(remaining_connections = remaining, "Some connections did not close gracefully");
        }

        initial.saturating_sub(remaining)
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub clients_notified: usize,
    pub connections_closed: usize,
    pub duration: Duration,
}
