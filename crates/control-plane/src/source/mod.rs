// Change source selection
// Decision: DATABASE_URL set -> Postgres LISTEN/NOTIFY, otherwise the in-memory feed

pub mod pg;

use std::sync::Arc;

use anyhow::{Context, Result};
use depot_core::{ChangeFeed, MemoryUpstream};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

pub use pg::PgNotifyUpstream;

/// Build the shared feed for this process
pub async fn build_feed(config: &ServerConfig, shutdown: &CancellationToken) -> Result<ChangeFeed> {
    match &config.database_url {
        Some(url) => {
            let feed = PgNotifyUpstream::start(
                url,
                &config.notify_channel_prefix,
                config.subscriber_buffer,
                shutdown.clone(),
            )
            .await
            .context("Failed to connect change listener to database")?;
            tracing::info!(prefix = %config.notify_channel_prefix, "Using Postgres change source");
            Ok(feed)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory change source (dev mode)");
            Ok(ChangeFeed::with_buffer(
                Arc::new(MemoryUpstream::new()),
                config.subscriber_buffer,
            ))
        }
    }
}
