// src/main.rs

//! # filehub entry point
//!
//! Loads configuration, sets up logging, starts the hub, the web server, and
//! (when folders are given) the file system watcher, then waits for Ctrl-C.

use anyhow::Result;
use filehub::config::AppConfig;
use filehub::event::Event;
use filehub::hub::Hub;
use filehub::{watcher, web};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing subscriber for logging with environment filter and max level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr) // Log to stderr
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default tracing subscriber failed");

    tracing::info!("filehub starting with configuration: {:?}", app_config);

    // Shutdown signal channel for graceful shutdown of all tasks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (hub, hub_task) = Hub::spawn(app_config.hub_queue, shutdown_rx.clone());
    let mut tasks = vec![hub_task];

    if !app_config.folders_to_watch.is_empty() {
        tracing::info!(
            "Starting watcher for folders: {:?}",
            app_config.folders_to_watch
        );
        let (watcher_event_tx, mut watcher_event_rx) = mpsc::channel::<Event>(100);
        watcher::run_watcher(Arc::clone(&app_config), watcher_event_tx).await?;

        // Forward watcher events into the hub.
        let forward_hub = hub.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = watcher_event_rx.recv() => {
                        tracing::debug!("Forwarding watcher event: {}", event);
                        if forward_hub.broadcast(event).await.is_err() {
                            tracing::info!("Hub stopped. Watcher forwarding exiting.");
                            break;
                        }
                    }
                    Ok(()) = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("Watcher forwarding shutting down.");
                            break;
                        }
                    }
                    else => {
                        tracing::info!("Watcher event channel closed. Forwarding exiting.");
                        break;
                    }
                }
            }
        }));
    }

    let web_config = Arc::clone(&app_config);
    let web_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = web::start_server(web_config, hub, web_shutdown_rx).await {
            tracing::error!("Web server exited with error: {}", e);
        }
    }));

    // Wait for Ctrl-C signal to initiate shutdown.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Ctrl-C received, initiating shutdown...");
        }
        Err(err) => {
            tracing::error!("Failed to listen for Ctrl-C signal: {}", err);
        }
    }

    if shutdown_tx.send(true).is_err() {
        tracing::error!("Failed to send shutdown signal");
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("A task panicked or exited with error: {}", e);
        }
    }

    tracing::info!("filehub shut down gracefully.");
    Ok(())
}
