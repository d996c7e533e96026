use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use anchor_event_relay::config::Settings;
use anchor_event_relay::dispatch::DispatchWorker;
use anchor_event_relay::handler::{EventHandler, Handler};
use anchor_event_relay::server::{create_app, AppState};
use anchor_event_relay::service::{EventService, Transports};
use anchor_event_relay::shutdown::{GracefulShutdown, ShutdownConfig};
use anchor_event_relay::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Arc::new(Settings::new()?);

    // Initialize tracing; the guard flushes spans on drop
    let _telemetry = init_telemetry(&settings.otel, &settings.logging)?;
    tracing::info!("Configuration loaded");

    let transports = Transports::from_settings(&settings)?;
    let event_service = Arc::new(EventService::new(&settings, transports));

    let handler = Handler::from_settings(&settings.callback_api)?;
    tracing::info!(handler = handler.name(), "Event handler initialized");
    let handler: Arc<dyn EventHandler> = Arc::new(handler);

    // Start one dispatch worker per consumed channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut worker_stats = Vec::new();
    let mut worker_handles = Vec::new();

    for channel in settings.consumed_channels() {
        let worker = match DispatchWorker::from_settings(
            &event_service,
            &settings,
            &channel,
            handler.clone(),
        )
        .await
        {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Cannot set up consumed channel, no worker started");
                continue;
            }
        };

        worker_stats.push(worker.stats());
        worker_handles.push(worker.spawn(shutdown_tx.subscribe()));
    }
    tracing::info!(workers = worker_handles.len(), "Dispatch workers started");

    // Create Axum app
    let state = AppState::new(settings.clone(), event_service.clone()).with_workers(worker_stats);
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server until a termination signal arrives
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let result = GracefulShutdown::new(event_service, shutdown_tx)
        .with_config(ShutdownConfig {
            drain_timeout: settings.dispatch.drain_timeout(),
        })
        .with_workers(worker_handles)
        .execute("termination signal")
        .await;

    if !result.success {
        tracing::warn!(
            workers_aborted = result.workers_aborted,
            close_failures = result.close_failures,
            "Shutdown finished with errors"
        );
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
