//! shepherd scheduler
//!
//! Runs the service listener against an in-process coordination store and
//! serves the HTTP API for declaring services and inspecting instances.

use std::sync::Arc;

use anyhow::Result;
use shepherd_coord::{Coordinator, MemoryStore};
use shepherd_scheduler::{
    api, config, control,
    engine::Reconciler,
    listener::ServiceListener,
    records::RecordStore,
    selector::LeastLoadedSelector,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to SHEPHERD_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting shepherd scheduler");
    info!(
        listen_addr = %config.listen_addr,
        sync_interval_secs = config.sync_interval.as_secs(),
        hosts = config.hosts.len(),
        "Configuration loaded"
    );

    let store = MemoryStore::new();
    let conn: Arc<dyn Coordinator> = Arc::new(store.session());
    let records = RecordStore::new(conn.clone());

    for host in &config.hosts {
        control::register_host(&records, host).await?;
    }
    if config.hosts.is_empty() {
        warn!("No hosts configured; new instances cannot be placed until one registers");
    }

    let selector = Arc::new(LeastLoadedSelector::new(records.clone()));
    let reconciler = Arc::new(Reconciler::new(conn, selector));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the service listener in background
    let listener = ServiceListener::with_reconciler(reconciler.clone(), config.listener());
    let listener_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            listener.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(reconciler));

    let tcp = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(async move {
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    let server_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            true
        }
    };

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if tokio::time::timeout(config.shutdown_timeout, listener_handle)
        .await
        .is_err()
    {
        warn!("Service listener did not shut down in time");
    }
    if !server_done
        && tokio::time::timeout(config.shutdown_timeout, server_handle)
            .await
            .is_err()
    {
        warn!("HTTP server did not shut down in time");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
