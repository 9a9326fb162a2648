//! Postgres LISTEN/NOTIFY change source.
//!
//! One [`PgListener`] connection is owned by a background task. Tables are
//! attached with `LISTEN <prefix><table>` and detached with `UNLISTEN`, driven
//! by the reference counts in [`ChangeFeed`]. Each notification payload is a
//! `ChangeNotification` JSON object and is handed to [`ChangeFeed::publish`].
//!
//! Producing the notifications is up to the database. A trigger along these
//! lines works for any table:
//!
//! ```sql
//! CREATE OR REPLACE FUNCTION depot_notify_change() RETURNS trigger AS $$
//! BEGIN
//!   PERFORM pg_notify(
//!     'depot_' || TG_TABLE_NAME,
//!     json_build_object(
//!       'table', TG_TABLE_NAME,
//!       'type', TG_OP,
//!       'record', CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE row_to_json(NEW) END,
//!       'old_record', CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE row_to_json(OLD) END
//!     )::text
//!   );
//!   RETURN NULL;
//! END;
//! $$ LANGUAGE plpgsql;
//!
//! CREATE TRIGGER orders_notify AFTER INSERT OR UPDATE OR DELETE ON orders
//!   FOR EACH ROW EXECUTE FUNCTION depot_notify_change();
//! ```
//!
//! NOTIFY payloads are capped at 8000 bytes by Postgres; wider rows need a
//! trimmed `json_build_object`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use depot_core::{ChangeFeed, RelayError, Upstream};
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed reconnect before trying again
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

enum Command {
    Listen {
        channel: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Unlisten {
        channel: String,
    },
}

pub struct PgNotifyUpstream {
    commands: mpsc::UnboundedSender<Command>,
    prefix: String,
}

impl PgNotifyUpstream {
    /// Connect the listener and return a feed backed by it.
    ///
    /// The listener task runs until `shutdown` fires, at which point every
    /// open stream is ended.
    pub async fn start(
        database_url: &str,
        prefix: &str,
        subscriber_buffer: usize,
        shutdown: CancellationToken,
    ) -> Result<ChangeFeed, sqlx::Error> {
        let listener = PgListener::connect(database_url).await?;
        info!("Change listener connected to database");

        let (commands, receiver) = mpsc::unbounded_channel();
        let upstream = Arc::new(Self {
            commands,
            prefix: prefix.to_string(),
        });
        let feed = ChangeFeed::with_buffer(upstream, subscriber_buffer);

        let task = ListenerTask {
            listener,
            commands: receiver,
            feed: feed.clone(),
            prefix: prefix.to_string(),
        };
        tokio::spawn(task.run(shutdown));

        Ok(feed)
    }

    fn channel_for(&self, table: &str) -> String {
        channel_name(&self.prefix, table)
    }
}

#[async_trait]
impl Upstream for PgNotifyUpstream {
    async fn attach(&self, table: &str) -> Result<(), RelayError> {
        let (reply, acknowledged) = oneshot::channel();
        self.commands
            .send(Command::Listen {
                channel: self.channel_for(table),
                reply,
            })
            .map_err(|_| RelayError::upstream("change listener stopped"))?;

        acknowledged
            .await
            .map_err(|_| RelayError::upstream("change listener stopped"))?
            .map_err(|e| RelayError::upstream(format!("LISTEN failed: {}", e)))
    }

    fn detach(&self, table: &str) {
        let _ = self.commands.send(Command::Unlisten {
            channel: self.channel_for(table),
        });
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

struct ListenerTask {
    listener: PgListener,
    commands: mpsc::UnboundedReceiver<Command>,
    feed: ChangeFeed,
    prefix: String,
}

impl ListenerTask {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                received = self.listener.try_recv() => match received {
                    Ok(Some(notification)) => {
                        match table_for_channel(&self.prefix, notification.channel()) {
                            Some(table) => {
                                let delivered = self.feed.publish(table, notification.payload());
                                debug!(table = %table, delivered, "Change notification");
                            }
                            None => debug!(channel = notification.channel(), "Ignoring notification on foreign channel"),
                        }
                    }
                    Ok(None) => {
                        // Reconnect happens on the next call; changes in the gap are lost
                        warn!("Change listener connection lost, ending open streams");
                        self.feed.close_all();
                    }
                    Err(e) => {
                        error!(error = %e, "Change listener reconnect failed");
                        self.feed.close_all();
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                },
            }
        }

        self.feed.close_all();
        info!("Change listener stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Listen { channel, reply } => {
                let result = self.listener.listen(&channel).await;
                match &result {
                    Ok(()) => debug!(channel = %channel, "LISTEN"),
                    Err(e) => warn!(channel = %channel, error = %e, "LISTEN failed"),
                }
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }
            Command::Unlisten { channel } => match self.listener.unlisten(&channel).await {
                Ok(()) => debug!(channel = %channel, "UNLISTEN"),
                Err(e) => warn!(channel = %channel, error = %e, "UNLISTEN failed"),
            },
        }
    }
}

fn channel_name(prefix: &str, table: &str) -> String {
    format!("{}{}", prefix, table)
}

/// Table a channel belongs to, if it carries our prefix
fn table_for_channel<'a>(prefix: &str, channel: &'a str) -> Option<&'a str> {
    channel.strip_prefix(prefix).filter(|table| !table.is_empty())
}
