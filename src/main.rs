//! Blob Cache - maintenance process
//!
//! Opens the cache store, keeps it purged of expired entries, and closes it
//! cleanly on shutdown.

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blob_cache::{spawn_purge_task, BlobCache, CacheConfig};

/// Main entry point for the blob cache maintenance process.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the store, creating the schema if needed
/// 4. Start background purge task
/// 5. Wait for SIGINT/SIGTERM, then flush and close the store
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blob_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting blob cache maintenance");

    let config = CacheConfig::from_env();
    info!(
        "Configuration loaded: path={}, insert_chunk_size={}, purge_interval={}s, busy_timeout={}ms",
        config.path.display(),
        config.insert_chunk_size,
        config.purge_interval,
        config.busy_timeout_ms
    );

    let cache = Arc::new(BlobCache::open(config).await?);
    info!("Store holds {} live entries", cache.entry_count().await?);

    let purge_handle = spawn_purge_task(cache.clone(), cache.config().purge_interval);
    info!("Background purge task started");

    shutdown_signal().await;

    purge_handle.abort();
    warn!("Purge task aborted");

    cache.flush().await?;
    let stats = cache.stats().await;
    info!("Final stats: {}", serde_json::to_string(&stats)?);

    cache.close().await?;
    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
