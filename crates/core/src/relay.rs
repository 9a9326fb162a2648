// Event Relay
//
// One Relay per accepted client connection. It bridges a SourceHandle to a
// FrameSink: a `connected` frame first, then one frame per upstream change,
// plus periodic heartbeats. Teardown releases the subscription exactly once.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::events::{ChangeEvent, MonotonicClock};
use crate::frame::Frame;
use crate::source::{ChangeSource, FeedItem, SourceHandle};
use crate::topic::Topic;

/// Default interval between heartbeat events
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// FrameSink
// ============================================================================

/// Transport a relay writes frames to
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one frame atomically.
    ///
    /// Returns [`RelayError::ClientDisconnected`] when the peer is gone and
    /// [`RelayError::Transport`] for any other failure.
    async fn write(&mut self, frame: &Frame) -> Result<(), RelayError>;

    /// Resolves once the peer has gone away
    async fn closed(&self);

    /// Close the underlying handle; further writes are never attempted
    fn close(&mut self);
}

// ============================================================================
// Configuration and outcome
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

impl RelayConfig {
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval.filter(|d| !d.is_zero());
        self
    }
}

/// Why a relay stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Peer closed the connection
    ClientDisconnected,
    /// Server-side cancellation (shutdown)
    Cancelled,
    /// Change source ended the subscription; the client should reconnect
    UpstreamEnded,
    /// Writing to the peer failed
    TransportFailed(RelayError),
}

enum Step {
    Cancelled,
    PeerGone,
    Item(Option<FeedItem>),
    Heartbeat,
}

// ============================================================================
// Relay
// ============================================================================

pub struct Relay<S: FrameSink> {
    connection_id: Uuid,
    sink: S,
    handle: Option<SourceHandle>,
    clock: MonotonicClock,
    config: RelayConfig,
    closed: bool,
    frames_written: u64,
    skipped: u64,
}

impl<S: FrameSink> Relay<S> {
    /// Subscribe and write the `connected` frame.
    ///
    /// A failed subscribe returns before anything is written, so the client
    /// never sees a stream that is not live.
    pub async fn open(
        source: &dyn ChangeSource,
        topics: &[Topic],
        sink: S,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let handle = source.subscribe(topics).await.map_err(|e| match e {
            RelayError::UpstreamUnavailable(_) => e,
            other => RelayError::upstream(other.to_string()),
        })?;

        let mut relay = Self {
            connection_id: Uuid::now_v7(),
            sink,
            handle: Some(handle),
            clock: MonotonicClock::new(),
            config,
            closed: false,
            frames_written: 0,
            skipped: 0,
        };

        let connected = ChangeEvent::connected(relay.clock.now());
        relay.write_event(&connected).await?;

        info!(
            connection_id = %relay.connection_id,
            topics = ?topics.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            "Relay connected"
        );
        Ok(relay)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Events dropped because they were malformed or failed to serialize
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drive the connection until the peer leaves, the upstream ends,
    /// `cancel` fires, or a write fails.
    pub async fn run(mut self, cancel: CancellationToken) -> RelayOutcome {
        let mut heartbeat = self.config.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let outcome = loop {
            if self.closed {
                break RelayOutcome::ClientDisconnected;
            }

            // Abort is only observed here, between writes
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = self.sink.closed() => Step::PeerGone,
                item = next_item(&mut self.handle) => Step::Item(item),
                _ = next_tick(&mut heartbeat) => Step::Heartbeat,
            };

            let written = match step {
                Step::Cancelled => break RelayOutcome::Cancelled,
                Step::PeerGone => break RelayOutcome::ClientDisconnected,
                Step::Item(None) => break RelayOutcome::UpstreamEnded,
                Step::Item(Some(item)) => self.forward(item).await,
                Step::Heartbeat => {
                    let event = ChangeEvent::heartbeat(self.clock.now());
                    self.write_event(&event).await
                }
            };

            match written {
                Ok(()) => {}
                Err(RelayError::ClientDisconnected) => break RelayOutcome::ClientDisconnected,
                Err(e) => break RelayOutcome::TransportFailed(e),
            }
        };

        self.close();
        info!(
            connection_id = %self.connection_id,
            outcome = ?outcome,
            frames = self.frames_written,
            skipped = self.skipped,
            "Relay finished"
        );
        outcome
    }

    /// Serialize and write one event.
    ///
    /// A no-op after teardown. Serialization failures skip the event; a
    /// write failure tears the connection down and is returned.
    pub async fn write_event(&mut self, event: &ChangeEvent) -> Result<(), RelayError> {
        if self.closed {
            return Ok(());
        }

        let frame = match Frame::encode(event) {
            Ok(frame) => frame,
            Err(e) if e.is_recoverable() => {
                self.skipped += 1;
                warn!(connection_id = %self.connection_id, error = %e, "Skipping event that failed to serialize");
                return Ok(());
            }
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        if let Err(e) = self.sink.write(&frame).await {
            debug!(connection_id = %self.connection_id, error = %e, "Write failed, tearing down");
            self.close();
            return Err(e);
        }

        self.frames_written += 1;
        Ok(())
    }

    async fn forward(&mut self, item: FeedItem) -> Result<(), RelayError> {
        match item {
            FeedItem::Change(notification) => {
                let timestamp = self.clock.now();
                match ChangeEvent::from_notification(&notification, timestamp) {
                    Ok(event) => self.write_event(&event).await,
                    Err(e) if e.is_recoverable() => {
                        self.skipped += 1;
                        warn!(connection_id = %self.connection_id, table = %notification.table, error = %e, "Skipping unmappable change");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            FeedItem::Malformed { table, reason } => {
                self.skipped += 1;
                warn!(connection_id = %self.connection_id, table = %table, reason = %reason, "Skipping malformed notification");
                Ok(())
            }
        }
    }

    /// Stop writing, release the subscription and close the sink.
    ///
    /// Synchronous and idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut handle) = self.handle.take() {
            handle.unsubscribe();
        }
        self.sink.close();
    }
}

impl<S: FrameSink> Drop for Relay<S> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn next_item(handle: &mut Option<SourceHandle>) -> Option<FeedItem> {
    match handle {
        Some(handle) => handle.recv().await,
        None => None,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
