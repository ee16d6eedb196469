use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::metrics::TransportMetrics;
use crate::resilience::{ExponentialBackoff, ListenerHealth};

use super::TransportError;

/// How one connected listener session ended
pub(crate) enum SessionEnd {
    Shutdown,
    Lost,
}

/// Receivers handed to a listener task when it starts.
pub(crate) struct ListenerContext {
    pub shutdown: broadcast::Receiver<()>,
    /// Channels registered after start that still need a LISTEN/SUBSCRIBE
    pub listen_requests: mpsc::UnboundedReceiver<String>,
}

/// Start/stop plumbing shared by the transports' listener tasks.
///
/// A lifecycle starts at most once; a stopped transport is not restarted.
pub(crate) struct ListenerLifecycle {
    shutdown: broadcast::Sender<()>,
    listen_tx: mpsc::UnboundedSender<String>,
    listen_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl ListenerLifecycle {
    pub fn new(stop_timeout: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (listen_tx, listen_rx) = mpsc::unbounded_channel();
        Self {
            shutdown,
            listen_tx,
            listen_rx: Mutex::new(Some(listen_rx)),
            task: Mutex::new(None),
            stop_timeout,
        }
    }

    pub async fn begin(&self) -> Result<ListenerContext, TransportError> {
        let listen_requests = self
            .listen_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        Ok(ListenerContext {
            shutdown: self.shutdown.subscribe(),
            listen_requests,
        })
    }

    pub async fn attach(&self, handle: JoinHandle<()>) {
        *self.task.lock().await = Some(handle);
    }

    /// Ask a running listener to add a channel. Before start the request is
    /// queued; after stop it is discarded.
    pub fn request_listen(&self, channel: &str) {
        let _ = self.listen_tx.send(channel.to_string());
    }

    /// Returns false when the listener had to be aborted after the timeout.
    pub async fn stop(&self) -> bool {
        let _ = self.shutdown.send(());

        let Some(mut handle) = self.task.lock().await.take() else {
            return true;
        };

        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Listener did not stop in time, aborting"
                );
                handle.abort();
                false
            }
        }
    }
}

/// Mark the listener as reconnecting and sleep for the next backoff delay.
/// Returns false when shutdown arrives while waiting.
pub(crate) async fn wait_before_reconnect(
    ctx: &mut ListenerContext,
    backoff: &mut ExponentialBackoff,
    health: &ListenerHealth,
    backend: &'static str,
) -> bool {
    health.set_reconnecting();
    TransportMetrics::record_reconnect(backend);
    TransportMetrics::set_listener_status(backend, health.status());

    let delay = backoff.next_delay();
    tracing::info!(
        backend,
        attempt = backoff.attempt(),
        delay_ms = delay.as_millis() as u64,
        "Reconnecting listener"
    );

    tokio::select! {
        _ = ctx.shutdown.recv() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
