//! kiln server entry point.
//!
//! Loads configuration from the environment, recovers state left by a
//! previous run, then serves the HTTP control API until Ctrl-C.

use kiln_core::{
    InMemoryCatalog, InMemoryRepository, LifecycleController, PlaintextCipher, Services,
};
use kiln_server::{http, AppState, KilnConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("kiln_server=info".parse()?)
                .add_directive("kiln_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting kiln server");

    // Load configuration from environment
    let config = KilnConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only so development hosts without images still start
    config.validate_warn();

    let workspaces = config.load_workspaces()?;
    tracing::info!(count = workspaces.len(), "Workspaces loaded");

    let services = Services::from_config(
        config.core.clone(),
        Arc::new(InMemoryRepository::new()),
        Arc::new(InMemoryCatalog::with_workspaces(workspaces)),
        Arc::new(PlaintextCipher),
    );
    let controller = Arc::new(LifecycleController::new(services));

    let recovered = controller.recover().await?;
    tracing::info!(recovered, "Sandbox records recovered");

    // Same registrar, and lock, the sagas use
    if let Err(e) = controller.services().proxy.ensure_wildcard().await {
        tracing::warn!(error = %e, "Could not install wildcard proxy route");
    }

    let state = AppState::new(Arc::clone(&controller), config.queue);
    let queue = Arc::clone(&state.queue);

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Periodic sweep of finished jobs
    let cleanup_queue = Arc::clone(&queue);
    let cleanup_interval = config.job_cleanup_interval;
    let mut cleanup_shutdown = shutdown_tx.subscribe();
    let cleanup_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cleanup_queue.cleanup().await;
                }
                _ = cleanup_shutdown.recv() => break,
            }
        }
    });

    // HTTP server
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });
    tracing::info!(addr = %http_addr, mode = ?config.core.mode, "Server ready");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());
    queue.shutdown().await;

    let _ = http_handle.await;
    let _ = cleanup_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
