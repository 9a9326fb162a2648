// Depot relay server
// Decision: One shared ChangeFeed per process, one Relay task per SSE connection
// Decision: Ctrl-c cancels every relay through a shared CancellationToken

use anyhow::{Context, Result};
use depot_control_plane::{build_app, source, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "depot_control_plane=debug,depot_core=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    // - RUST_LOG or LOG_LEVEL: Log filter (default: DEFAULT_LOG_FILTER)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL")
                .map_err(anyhow::Error::from)
                .and_then(|level| Ok(tracing_subscriber::EnvFilter::try_new(level)?))
        })
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("depot-control-plane starting...");

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    let shutdown = CancellationToken::new();

    let feed = source::build_feed(&config, &shutdown).await?;
    let app = build_app(&config, feed.clone(), shutdown.clone());

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!(
        addr = %config.http_addr,
        source = feed.upstream_name(),
        dev_mode = config.is_dev_mode(),
        "HTTP server listening"
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    tracing::info!(subscribers = feed.subscriber_count(), "Server shutdown complete");
    Ok(())
}
