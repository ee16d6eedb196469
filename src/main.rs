use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use realtime_relay::config::Settings;
use realtime_relay::server::{create_app, AppState};
use realtime_relay::shutdown::GracefulShutdown;
use realtime_relay::tasks::HeartbeatTask;
use realtime_relay::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(
        backend = settings.transport.backend.as_str(),
        multi_tenant = settings.tenant.enabled,
        cluster = settings.cluster.enabled,
        "Configuration loaded"
    );

    let state = AppState::bootstrap(settings.clone()).await?;
    state.router.start().await?;
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let heartbeat_task = HeartbeatTask::new(
        settings.websocket.clone(),
        state.gateway.clone(),
        shutdown_tx.subscribe(),
    );
    let heartbeat_handle = tokio::spawn(heartbeat_task.run());

    let graceful = GracefulShutdown::new(
        state.gateway.clone(),
        state.router.clone(),
        shutdown_tx,
    );
    let postgres_pool = state.postgres_pool.clone();

    let app = create_app(state);
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Clients are told to reconnect before the server stops accepting.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = shutdown_signal().await;
            graceful.execute(reason).await;
        })
        .await?;

    let _ = heartbeat_handle.await;
    if let Some(pool) = postgres_pool {
        pool.close().await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            "ctrl_c"
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
            "sigterm"
        }
    }
}
