//! JPIP Streamer server binary.
//!
//! Registers every codestream found in the data directory, then serves the
//! HTTP/WebSocket surface until interrupted. Background sweeps expire idle
//! sessions and connections.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use jpip_streamer::codestream::MarkerCodestream;
use jpip_streamer::config::Config;
use jpip_streamer::server::{
    create_router, AppState, ConnectionManager, RequestEngine,
};

/// Interval between idle sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    if let Err(message) = config.validate() {
        error!(%message, "invalid configuration");
        std::process::exit(1);
    }

    let engine = Arc::new(RequestEngine::new(
        MarkerCodestream::new(),
        config.engine_config(),
    ));
    let connections = Arc::new(ConnectionManager::new(config.connection_config()));

    if let Some(data_dir) = &config.data_dir {
        match register_targets(&engine, data_dir).await {
            Ok(count) => info!(count, dir = %data_dir.display(), "targets registered"),
            Err(e) => warn!(error = %e, "target registration failed"),
        }
    }

    // Idle sweeps for sessions and connections.
    {
        let engine = Arc::clone(&engine);
        let connections = Arc::clone(&connections);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                engine.expire_idle_sessions().await;
                connections.sweep_idle().await;
            }
        });
    }

    let router = create_router(AppState {
        engine,
        connections,
    });

    let address = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %address, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%address, "listening");

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }
}

/// Register every `.jp2`/`.j2k`/`.j2c` file in the directory as a target
/// named by its file name.
async fn register_targets(
    engine: &RequestEngine<MarkerCodestream>,
    dir: &std::path::Path,
) -> std::io::Result<usize> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_codestream = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "jp2" | "j2k" | "j2c"));
        if !is_codestream {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let bytes = tokio::fs::read(&path).await?;
        match engine.register_target(name, bytes).await {
            Ok(()) => count += 1,
            Err(e) => warn!(target = %name, error = %e, "skipping unreadable codestream"),
        }
    }
    Ok(count)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "shutdown signal listener failed");
    }
    info!("shutting down");
}
