//! Reconnecting listener loop shared by the broker and database-notify
//! transports.
//!
//! Each session opens a dedicated connection, re-registers every channel in
//! the [`SubscriptionSet`] and then delivers messages until the connection is
//! lost or shutdown is signalled. A lost session waits out the backoff and
//! starts over with all channels registered again.

use std::sync::Arc;

use async_trait::async_trait;

use crate::metrics::TransportMetrics;
use crate::resilience::{ExponentialBackoff, ListenerHealth, ListenerStatus};

use super::{wait_before_reconnect, ListenerContext, SessionEnd, SubscriptionSet, TransportError};

/// A message as read off the dedicated connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawMessage {
    pub channel: String,
    pub payload: String,
}

/// How the channel name of a received message is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelNaming {
    /// Wire names may embed the tenant (`tenant-{t}-{channel}`)
    Qualified,
    /// Logical channel names; the tenant rides in the envelope only
    Bare,
}

/// One connected session on the dedicated listener connection.
#[async_trait]
pub(crate) trait ListenerConnection: Send {
    /// Start receiving a logical channel
    async fn listen(&mut self, channel: &str) -> Result<(), TransportError>;

    /// Next message; `None` when the server closed the connection
    async fn recv(&mut self) -> Result<Option<RawMessage>, TransportError>;

    /// Release server-side registrations before the connection is dropped
    async fn close(&mut self);
}

/// Opens listener sessions for one backend.
#[async_trait]
pub(crate) trait ListenerConnector: Send + Sync + 'static {
    type Connection: ListenerConnection;

    fn backend(&self) -> &'static str;

    fn naming(&self) -> ChannelNaming;

    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

pub(crate) struct Listener<C: ListenerConnector> {
    connector: C,
    subscriptions: SubscriptionSet,
    health: Arc<ListenerHealth>,
    backoff: ExponentialBackoff,
}

impl<C: ListenerConnector> Listener<C> {
    pub fn new(
        connector: C,
        subscriptions: SubscriptionSet,
        health: Arc<ListenerHealth>,
        backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            connector,
            subscriptions,
            health,
            backoff,
        }
    }

    pub async fn run(mut self, mut ctx: ListenerContext) {
        let backend = self.connector.backend();

        loop {
            match self.session(&mut ctx).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost) => {
                    tracing::warn!(backend, "Listener connection lost");
                }
                Err(e) => {
                    tracing::warn!(backend, error = %e, "Listener session failed");
                }
            }

            if !wait_before_reconnect(&mut ctx, &mut self.backoff, &self.health, backend).await {
                break;
            }
        }

        self.health.set_stopped();
        TransportMetrics::set_listener_status(backend, ListenerStatus::Stopped);
        tracing::info!(backend, "Listener stopped");
    }

    async fn session(&mut self, ctx: &mut ListenerContext) -> Result<SessionEnd, TransportError> {
        let backend = self.connector.backend();
        let mut conn = self.connector.connect().await?;

        let channels = self.subscriptions.channels();
        for channel in &channels {
            conn.listen(channel).await?;
        }

        self.health.set_connected();
        self.backoff.reset();
        TransportMetrics::set_listener_status(backend, ListenerStatus::Connected);
        tracing::info!(backend, channels = channels.len(), "Listener subscriptions established");

        loop {
            tokio::select! {
                _ = ctx.shutdown.recv() => {
                    conn.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                Some(channel) = ctx.listen_requests.recv() => {
                    // Channels present at connect time are already registered.
                    if !channels.contains(&channel) {
                        conn.listen(&channel).await?;
                        tracing::debug!(backend, channel = %channel, "Listen added");
                    }
                }
                received = conn.recv() => match received? {
                    Some(message) => self.deliver(message).await,
                    None => return Ok(SessionEnd::Lost),
                }
            }
        }
    }

    async fn deliver(&self, message: RawMessage) {
        self.health.record_event();
        let outcome = match self.connector.naming() {
            ChannelNaming::Qualified => {
                self.subscriptions
                    .deliver_qualified(&message.channel, &message.payload)
                    .await
            }
            ChannelNaming::Bare => {
                self.subscriptions
                    .deliver_bare(&message.channel, &message.payload)
                    .await
            }
        };
        TransportMetrics::record_received(self.connector.backend(), outcome.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffConfig;
    use crate::transport::{Envelope, EventHandler, InboundEvent, ListenerLifecycle};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// What one scripted connection attempt does
    enum Script {
        Refuse,
        /// Accept, deliver these messages, then report the connection closed
        DeliverThenClose(Vec<RawMessage>),
        /// Accept, deliver these messages, then stay open
        DeliverThenIdle(Vec<RawMessage>),
    }

    #[derive(Default)]
    struct Record {
        /// Channels listened on, per established session
        sessions: Vec<Vec<String>>,
        /// Health status observed at each connect attempt
        statuses: Vec<ListenerStatus>,
        closed: usize,
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<Script>>,
        record: Arc<Mutex<Record>>,
        health: Arc<ListenerHealth>,
    }

    struct ScriptedConnection {
        pending: VecDeque<RawMessage>,
        close_when_drained: bool,
        record: Arc<Mutex<Record>>,
    }

    #[async_trait]
    impl ListenerConnection for ScriptedConnection {
        async fn listen(&mut self, channel: &str) -> Result<(), TransportError> {
            let mut record = self.record.lock().unwrap();
            if let Some(current) = record.sessions.last_mut() {
                current.push(channel.to_string());
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<RawMessage>, TransportError> {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            if self.close_when_drained {
                return Ok(None);
            }
            std::future::pending().await
        }

        async fn close(&mut self) {
            self.record.lock().unwrap().closed += 1;
        }
    }

    #[async_trait]
    impl ListenerConnector for ScriptedConnector {
        type Connection = ScriptedConnection;

        fn backend(&self) -> &'static str {
            "memory"
        }

        fn naming(&self) -> ChannelNaming {
            ChannelNaming::Qualified
        }

        async fn connect(&self) -> Result<ScriptedConnection, TransportError> {
            self.record.lock().unwrap().statuses.push(self.health.status());

            let step = self.script.lock().unwrap().pop_front();
            let (pending, close_when_drained) = match step {
                Some(Script::Refuse) | None => {
                    return Err(TransportError::ListenerDisconnected("connection refused".into()))
                }
                Some(Script::DeliverThenClose(messages)) => (messages, true),
                Some(Script::DeliverThenIdle(messages)) => (messages, false),
            };

            self.record.lock().unwrap().sessions.push(Vec::new());
            Ok(ScriptedConnection {
                pending: pending.into(),
                close_when_drained,
                record: self.record.clone(),
            })
        }
    }

    struct Forward(mpsc::UnboundedSender<InboundEvent>);

    #[async_trait]
    impl EventHandler for Forward {
        async fn handle(&self, event: InboundEvent) {
            let _ = self.0.send(event);
        }
    }

    fn message(channel: &str, tenant: &str, marker: &str) -> RawMessage {
        RawMessage {
            channel: format!("tenant-{}-{}", tenant, channel),
            payload: Envelope::new(json!({"marker": marker}), Some(tenant))
                .encode()
                .unwrap(),
        }
    }

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(BackoffConfig {
            initial_delay_ms: 5,
            max_delay_ms: 5,
            multiplier: 1.0,
            jitter_factor: 0.0,
        })
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> InboundEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within window")
            .expect("handler alive")
    }

    #[tokio::test]
    async fn test_lost_connection_resubscribes_every_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriptions = SubscriptionSet::new();
        subscriptions.register("task-updated", Arc::new(Forward(tx.clone()))).unwrap();
        subscriptions.register("board-updated", Arc::new(Forward(tx))).unwrap();

        let health = Arc::new(ListenerHealth::new());
        let record = Arc::new(Mutex::new(Record::default()));
        let connector = ScriptedConnector {
            script: Mutex::new(VecDeque::from([
                Script::DeliverThenClose(vec![message("task-updated", "t1", "before")]),
                Script::Refuse,
                Script::DeliverThenIdle(vec![message("board-updated", "t1", "after")]),
            ])),
            record: record.clone(),
            health: health.clone(),
        };

        let lifecycle = ListenerLifecycle::new(Duration::from_secs(1));
        let ctx = lifecycle.begin().await.unwrap();
        let listener = Listener::new(connector, subscriptions, health.clone(), fast_backoff());
        lifecycle.attach(tokio::spawn(listener.run(ctx))).await;

        assert_eq!(next_event(&mut rx).await.envelope.data["marker"], "before");
        let resumed = next_event(&mut rx).await;
        assert_eq!(resumed.channel, "board-updated");
        assert_eq!(resumed.envelope.data["marker"], "after");

        assert_eq!(health.status(), ListenerStatus::Connected);
        assert_eq!(health.stats().total_reconnections, 1);

        {
            let record = record.lock().unwrap();
            assert_eq!(
                record.statuses,
                vec![
                    ListenerStatus::Idle,
                    ListenerStatus::Reconnecting,
                    ListenerStatus::Reconnecting,
                ]
            );
            assert_eq!(record.sessions.len(), 2);
            for session in &record.sessions {
                let mut channels = session.clone();
                channels.sort();
                assert_eq!(channels, vec!["board-updated", "task-updated"]);
            }
        }

        assert!(lifecycle.stop().await);
        assert_eq!(health.status(), ListenerStatus::Stopped);
        assert_eq!(record.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn test_channel_registered_after_start_is_listened() {
        let subscriptions = SubscriptionSet::new();
        let health = Arc::new(ListenerHealth::new());
        let record = Arc::new(Mutex::new(Record::default()));
        let connector = ScriptedConnector {
            script: Mutex::new(VecDeque::from([Script::DeliverThenIdle(vec![])])),
            record: record.clone(),
            health: health.clone(),
        };

        let lifecycle = ListenerLifecycle::new(Duration::from_secs(1));
        let ctx = lifecycle.begin().await.unwrap();
        let listener = Listener::new(connector, subscriptions.clone(), health.clone(), fast_backoff());
        lifecycle.attach(tokio::spawn(listener.run(ctx))).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        subscriptions.register("member-updated", Arc::new(Forward(tx))).unwrap();
        lifecycle.request_listen("member-updated");

        let listened = async {
            loop {
                let done = record
                    .lock()
                    .unwrap()
                    .sessions
                    .first()
                    .is_some_and(|s| s.contains(&"member-updated".to_string()));
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), listened)
            .await
            .expect("late channel listened");

        lifecycle.stop().await;
    }
}
