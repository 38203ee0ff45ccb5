//! inputd: input subscription and distribution daemon
//!
//! Wires the subscription registry, the distribution pipeline fed by the
//! input listener, and the IPC server clients connect to. Runs until SIGINT
//! or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use inputd::config::Config;
use inputd::driver::SoftwareDriver;
use inputd::hotkey::InputListener;
use inputd::ipc::{Server, ServerLimits};
use inputd::lifecycle::ShutdownSignal;
use inputd::pipeline::{LogTarget, Pipeline};
use inputd::registry::Registry;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "inputd starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, "configuration loaded");

    // Create shutdown signal handler
    let shutdown = ShutdownSignal::new();

    let driver = Arc::new(SoftwareDriver::new());
    let registry = Arc::new(Registry::new(driver.clone(), config.consumption_window));
    let pipeline = Pipeline::new(Arc::clone(&registry), Arc::new(LogTarget))
        .with_consumption_timeout(Duration::from_millis(config.consumption_timeout_ms));

    // Input listener -> distribution pipeline
    let (event_tx, event_rx) = mpsc::channel(256);
    let listener = InputListener::new(event_tx);

    // Start the input listener
    match driver.take_raw_input() {
        Some(raw_rx) => match listener.start(raw_rx) {
            Ok(()) => info!("input listener started"),
            Err(e) => error!(?e, "failed to start input listener"),
        },
        None => warn!("raw input stream unavailable, continuing without input"),
    }

    let server = Server::new(&config.socket_path, Arc::clone(&registry), ServerLimits::from(&config))?;
    let mut sessions = server.subscribe_sessions();

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        _ = pipeline.run(event_rx) => {
            info!("distribution pipeline exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = async {
            loop {
                match sessions.recv().await {
                    Ok(event) => info!(%event, "session event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "session event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("session event handler exited");
        }

        // Wait for shutdown signal
        result = shutdown.wait() => {
            match result {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(?e, "signal handling failed"),
            }
        }
    }

    // Cleanup
    info!("shutting down...");

    listener.stop();
    server.shutdown().await;

    info!(stats = ?registry.stats(), "inputd stopped");

    Ok(())
}
