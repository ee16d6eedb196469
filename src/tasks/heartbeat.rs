use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::WebSocketConfig;
use crate::gateway::ConnectionGateway;
use crate::metrics::HeartbeatMetrics;

/// Heartbeat frames, stale connection cleanup and membership TTL refresh
pub struct HeartbeatTask {
    config: WebSocketConfig,
    gateway: Arc<ConnectionGateway>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        gateway: Arc<ConnectionGateway>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            gateway,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval.max(1));
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                    self.refresh_memberships().await;
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup_stale_connections(connection_timeout).await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    fn send_heartbeats(&self) {
        let start = Instant::now();
        let (sent, failed) = self.gateway.heartbeat();
        if sent + failed == 0 {
            return;
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        HeartbeatMetrics::record_round(elapsed_ms);

        tracing::debug!(sent, failed, elapsed_ms, "Heartbeat round completed");
    }

    async fn cleanup_stale_connections(&self, timeout_secs: u64) {
        let removed = self.gateway.cleanup_stale(timeout_secs).await;

        if removed > 0 {
            HeartbeatMetrics::record_stale_removed(removed as u64);
            tracing::info!(removed, timeout_secs, "Cleaned up stale connections");
        }
    }

    async fn refresh_memberships(&self) {
        let share = self.gateway.session_share();
        if !share.is_shared() {
            return;
        }

        let rooms = self.gateway.registry().room_members();
        match share.refresh(&rooms).await {
            Ok(refreshed) if refreshed > 0 => {
                tracing::debug!(refreshed, server_id = %share.server_id(), "Refreshed room memberships");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh room memberships");
            }
        }
    }
}
