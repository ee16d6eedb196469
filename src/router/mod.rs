//! The process-wide entry point for publishing and subscribing.
//!
//! Wraps the one transport chosen at bootstrap. Producers call
//! [`NotificationRouter::publish`] after their mutation committed and move on;
//! the write to the transport happens on a detached task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::TransportBackend;
use crate::metrics::TransportMetrics;
use crate::resilience::ListenerHealth;
use crate::transport::{EventHandler, Transport, TransportError};

/// Handle to a detached publish.
///
/// Dropping it is the normal case; the publish still runs to completion.
#[must_use = "call .detach() to make ignoring the publish outcome explicit"]
pub struct PublishHandle {
    task: JoinHandle<Result<(), TransportError>>,
}

impl PublishHandle {
    /// Wait for the transport write and return its result.
    pub async fn outcome(self) -> Result<(), TransportError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::TaskFailed(e.to_string())),
        }
    }

    pub fn detach(self) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub backend: &'static str,
    pub published: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
}

pub struct NotificationRouter {
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
}

impl NotificationRouter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        tracing::info!(backend = transport.backend().as_str(), "Notification router created");
        Self {
            transport,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Fire-and-forget publish. Never blocks the caller on the transport and
    /// never retries.
    pub fn publish(&self, channel: &str, payload: Value, tenant_id: Option<&str>) -> PublishHandle {
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let channel = channel.to_string();
        let tenant_id = tenant_id.map(str::to_string);

        let task = tokio::spawn(async move {
            let result = transport
                .publish(&channel, payload, tenant_id.as_deref())
                .await;
            record(&counters, transport.backend(), &result);
            result
        });

        PublishHandle { task }
    }

    /// Publish on the caller's task.
    pub async fn publish_and_wait(
        &self,
        channel: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let result = self.transport.publish(channel, payload, tenant_id).await;
        record(&self.counters, self.transport.backend(), &result);
        result
    }

    pub fn subscribe_all(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), TransportError> {
        self.transport.subscribe_all(channel, handler)
    }

    pub async fn start(&self) -> Result<(), TransportError> {
        self.transport.start().await
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
        tracing::info!(backend = self.backend().as_str(), "Notification router stopped");
    }

    pub fn health(&self) -> Arc<ListenerHealth> {
        self.transport.health()
    }

    pub fn backend(&self) -> TransportBackend {
        self.transport.backend()
    }

    pub fn supports_session_share(&self) -> bool {
        self.transport.supports_session_share()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            backend: self.backend().as_str(),
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

fn record(counters: &Counters, backend: TransportBackend, result: &Result<(), TransportError>) {
    match result {
        Ok(()) => {
            counters.published.fetch_add(1, Ordering::Relaxed);
            TransportMetrics::record_published(backend.as_str());
        }
        Err(e) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            TransportMetrics::record_dropped(backend.as_str(), e.reason());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBus, MemoryTransport};
    use serde_json::json;
    use std::time::Duration;

    fn memory_router(cap: Option<usize>) -> (NotificationRouter, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new(
            MemoryBus::new(16),
            cap,
            Duration::from_secs(1),
        ));
        (NotificationRouter::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_publish_outcome_and_stats() {
        let (router, _) = memory_router(None);

        tokio_test::assert_ok!(router.publish("task-updated", json!({}), Some("t1")).outcome().await);
        let stats = router.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.backend, "memory");
    }

    #[tokio::test]
    async fn test_dropped_publish_never_reaches_caller_as_panic() {
        let (router, transport) = memory_router(None);
        transport.set_available(false);

        router.publish("task-updated", json!({}), None).detach();
        let result = router.publish("task-updated", json!({}), None).outcome().await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.stats().dropped, 2);
    }

    #[tokio::test]
    async fn test_publish_and_wait_reports_too_large() {
        let (router, _) = memory_router(Some(100));
        let result = router
            .publish_and_wait("task-updated", json!({"blob": "x".repeat(200)}), None)
            .await;
        assert!(matches!(result, Err(TransportError::EnvelopeTooLarge { .. })));
        assert_eq!(router.stats().dropped, 1);
    }
}
