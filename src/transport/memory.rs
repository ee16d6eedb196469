//! In-process transport over a tokio broadcast channel.
//!
//! Uses the broker's naming: messages travel on tenant-qualified wire
//! channels and every listener sees every message. Several transports can
//! share one [`MemoryBus`] to stand in for several processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::channel::wire_channel;
use crate::config::TransportBackend;
use crate::metrics::TransportMetrics;
use crate::resilience::{ListenerHealth, ListenerStatus};

use super::{
    Envelope, EventHandler, ListenerLifecycle, SubscriptionSet, Transport, TransportError,
};

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub wire: String,
    pub raw: Arc<str>,
}

#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of listeners that will see the message
    pub fn send(&self, message: BusMessage) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct MemoryTransport {
    bus: MemoryBus,
    max_envelope_bytes: Option<usize>,
    available: Arc<AtomicBool>,
    subscriptions: SubscriptionSet,
    health: Arc<ListenerHealth>,
    lifecycle: ListenerLifecycle,
}

impl MemoryTransport {
    pub fn new(bus: MemoryBus, max_envelope_bytes: Option<usize>, stop_timeout: Duration) -> Self {
        Self {
            bus,
            max_envelope_bytes,
            available: Arc::new(AtomicBool::new(true)),
            subscriptions: SubscriptionSet::new(),
            health: Arc::new(ListenerHealth::new()),
            lifecycle: ListenerLifecycle::new(stop_timeout),
        }
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    /// Simulate a transport outage. While offline, publishes fail and the
    /// listener discards what it receives.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);

        match (available, self.health.status()) {
            (false, ListenerStatus::Connected) => {
                self.health.set_reconnecting();
                tracing::warn!("In-process transport marked unavailable");
            }
            (true, ListenerStatus::Reconnecting) => {
                self.health.set_connected();
                tracing::info!("In-process transport available again");
            }
            _ => {}
        }
        TransportMetrics::set_listener_status(BACKEND, self.health.status());
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn backend(&self) -> TransportBackend {
        TransportBackend::Memory
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<(), TransportError> {
        if !self.is_available() {
            tracing::warn!(channel = %channel, tenant_id = ?tenant_id, "In-process transport unavailable, dropping event");
            return Err(TransportError::Unavailable(
                "in-process bus is offline".to_string(),
            ));
        }

        let envelope = Envelope::new(payload, tenant_id);
        let encoded = match self.max_envelope_bytes {
            Some(limit) => envelope.encode_bounded(limit),
            None => envelope.encode(),
        }
        .inspect_err(|e| {
            tracing::warn!(channel = %channel, tenant_id = ?tenant_id, error = %e, "Dropping event");
        })?;

        let listeners = self.bus.send(BusMessage {
            wire: wire_channel(channel, tenant_id),
            raw: encoded.into(),
        });
        tracing::trace!(channel = %channel, listeners, "Published on in-process bus");
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
        let mut ctx = self.lifecycle.begin().await?;
        let mut messages = self.bus.subscribe();

        let subscriptions = self.subscriptions.clone();
        let health = self.health.clone();
        let available = self.available.clone();

        if self.is_available() {
            health.set_connected();
        } else {
            health.set_reconnecting();
        }
        TransportMetrics::set_listener_status(BACKEND, health.status());

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.shutdown.recv() => break,
                    Some(channel) = ctx.listen_requests.recv() => {
                        tracing::debug!(channel = %channel, "Listening on in-process bus");
                    }
                    received = messages.recv() => match received {
                        Ok(message) => {
                            if !available.load(Ordering::Acquire) {
                                TransportMetrics::record_received(BACKEND, "offline");
                                continue;
                            }
                            health.record_event();
                            let outcome = subscriptions
                                .deliver_qualified(&message.wire, &message.raw)
                                .await;
                            TransportMetrics::record_received(BACKEND, outcome.as_str());
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "In-process listener lagged, events lost");
                            TransportMetrics::record_received(BACKEND, "lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }

            health.set_stopped();
            TransportMetrics::set_listener_status(BACKEND, ListenerStatus::Stopped);
            tracing::info!("In-process listener stopped");
        });

        self.lifecycle.attach(handle).await;
        tracing::info!(channels = self.subscriptions.len(), "In-process listener started");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundEvent;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<InboundEvent>);

    #[async_trait]
    impl EventHandler for Forward {
        async fn handle(&self, event: InboundEvent) {
            let _ = self.0.send(event);
        }
    }

    fn transport(bus: &MemoryBus, cap: Option<usize>) -> MemoryTransport {
        MemoryTransport::new(bus.clone(), cap, Duration::from_secs(1))
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> Option<InboundEvent> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_publish_reaches_other_transport_on_bus() {
        let bus = MemoryBus::new(16);
        let publisher = transport(&bus, None);
        let subscriber = transport(&bus, None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.subscribe_all("task-updated", Arc::new(Forward(tx))).unwrap();
        subscriber.start().await.unwrap();

        publisher
            .publish("task-updated", json!({"boardId": "b1"}), Some("t1"))
            .await
            .unwrap();

        let event = recv(&mut rx).await.expect("event delivered");
        assert_eq!(event.channel, "task-updated");
        assert_eq!(event.envelope.tenant(), Some("t1"));
        assert_eq!(subscriber.health().stats().events_received, 1);

        subscriber.stop().await;
        assert_eq!(subscriber.health().status(), ListenerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_cap_rejects_oversized_envelope() {
        let bus = MemoryBus::new(16);
        let capped = transport(&bus, Some(8000));

        let result = capped
            .publish("task-updated", json!({"blob": "x".repeat(9000)}), Some("t1"))
            .await;
        assert!(matches!(result, Err(TransportError::EnvelopeTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_unavailable_fails_publish_and_degrades_health() {
        let bus = MemoryBus::new(16);
        let memory = transport(&bus, None);
        memory.start().await.unwrap();
        assert!(memory.health().is_healthy());

        memory.set_available(false);
        assert!(!memory.health().is_healthy());
        let result = memory.publish("task-updated", json!({}), None).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));

        memory.set_available(true);
        assert!(memory.health().is_healthy());
        assert_eq!(memory.health().stats().total_reconnections, 1);
        memory.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_fails() {
        let memory = transport(&MemoryBus::new(4), None);
        memory.start().await.unwrap();
        assert!(matches!(memory.start().await, Err(TransportError::AlreadyStarted)));
        memory.stop().await;
    }
}
