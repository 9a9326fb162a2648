// Integration tests for ChangeFeed + Relay + FrameDecoder
//
// Drives full relay connections against the in-memory upstream and decodes
// the wire text the way a client would.
//
// Run with: cargo test -p depot-core --test relay_stream_test

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use depot_core::{
    ChangeEvent, ChangeFeed, ChangeType, Frame, FrameDecoder, FrameSink, MemoryUpstream, Relay,
    RelayConfig, RelayError, RelayOutcome, Topic,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sink that forwards wire text over a channel; dropping the receiver is a disconnect
struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write(&mut self, frame: &Frame) -> Result<(), RelayError> {
        self.tx
            .send(frame.to_wire())
            .map_err(|_| RelayError::ClientDisconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    fn close(&mut self) {}
}

struct Client {
    rx: mpsc::UnboundedReceiver<String>,
    decoder: FrameDecoder,
    task: JoinHandle<RelayOutcome>,
}

impl Client {
    async fn next_event(&mut self) -> ChangeEvent {
        loop {
            let chunk = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("relay closed the stream");
            if let Some(event) = self.decoder.push(&chunk).into_iter().next() {
                return event;
            }
        }
    }
}

async fn connect(feed: &ChangeFeed, topics: &[&str], cancel: &CancellationToken) -> Client {
    let topics: Vec<Topic> = topics.iter().map(|t| t.parse().unwrap()).collect();
    let (tx, rx) = mpsc::unbounded_channel();
    let config = RelayConfig::default().with_heartbeat_interval(None);
    let relay = Relay::open(feed, &topics, ChannelSink { tx }, config)
        .await
        .unwrap();
    let task = tokio::spawn(relay.run(cancel.clone()));
    Client {
        rx,
        decoder: FrameDecoder::new(),
        task,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_two_clients_share_one_upstream() {
    let upstream = Arc::new(MemoryUpstream::new());
    let feed = ChangeFeed::new(upstream.clone());
    let cancel = CancellationToken::new();

    let mut all_orders = connect(&feed, &["orders"], &cancel).await;
    let mut open_orders = connect(&feed, &["orders:status=eq.open"], &cancel).await;
    assert_eq!(upstream.attach_count(), 1);

    assert_eq!(all_orders.next_event().await.event_type, ChangeType::Connected);
    assert_eq!(open_orders.next_event().await.event_type, ChangeType::Connected);

    feed.publish(
        "orders",
        r#"{"type":"INSERT","record":{"id":1,"status":"closed"}}"#,
    );
    feed.publish(
        "orders",
        r#"{"type":"UPDATE","record":{"id":2,"status":"open"},"old_record":{"id":2,"status":"new"}}"#,
    );

    let first = all_orders.next_event().await;
    let second = all_orders.next_event().await;
    assert_eq!(first.event_type, ChangeType::Inserted);
    assert_eq!(second.event_type, ChangeType::Updated);
    assert!(first.timestamp <= second.timestamp);

    let only = open_orders.next_event().await;
    assert_eq!(only.event_type, ChangeType::Updated);
    assert_eq!(only.payload.unwrap()["id"], 2);

    // First client leaves; the table stays attached for the second
    drop(all_orders.rx);
    assert_eq!(all_orders.task.await.unwrap(), RelayOutcome::ClientDisconnected);
    assert_eq!(upstream.detach_count(), 0);

    drop(open_orders.rx);
    assert_eq!(open_orders.task.await.unwrap(), RelayOutcome::ClientDisconnected);
    wait_until(|| upstream.detach_count() == 1).await;
    assert_eq!(feed.subscriber_count(), 0);
}

#[tokio::test]
async fn test_delete_carries_old_record() {
    let feed = ChangeFeed::new(Arc::new(MemoryUpstream::new()));
    let cancel = CancellationToken::new();
    let mut client = connect(&feed, &["drums"], &cancel).await;
    client.next_event().await;

    feed.publish("drums", r#"{"type":"DELETE","old_record":{"id":7}}"#);

    let event = client.next_event().await;
    assert_eq!(event.event_type, ChangeType::Deleted);
    assert_eq!(event.payload.unwrap()["id"], 7);
}

#[tokio::test]
async fn test_malformed_change_does_not_break_stream() {
    let feed = ChangeFeed::new(Arc::new(MemoryUpstream::new()));
    let cancel = CancellationToken::new();
    let mut client = connect(&feed, &["scans"], &cancel).await;
    client.next_event().await;

    feed.publish("scans", "not json at all");
    feed.publish("scans", r#"{"type":"INSERT"}"#);
    feed.publish("scans", r#"{"type":"INSERT","record":{"id":3}}"#);

    let event = client.next_event().await;
    assert_eq!(event.event_type, ChangeType::Inserted);
    assert_eq!(event.payload.unwrap()["id"], 3);
}

#[tokio::test]
async fn test_shutdown_cancels_every_relay() {
    let upstream = Arc::new(MemoryUpstream::new());
    let feed = ChangeFeed::new(upstream.clone());
    let cancel = CancellationToken::new();

    let a = connect(&feed, &["orders"], &cancel).await;
    let b = connect(&feed, &["drums"], &cancel).await;
    assert_eq!(feed.attached_tables(), vec!["drums".to_string(), "orders".to_string()]);

    cancel.cancel();
    assert_eq!(a.task.await.unwrap(), RelayOutcome::Cancelled);
    assert_eq!(b.task.await.unwrap(), RelayOutcome::Cancelled);
    assert!(feed.attached_tables().is_empty());
    assert_eq!(upstream.detach_count(), 2);
}

#[tokio::test]
async fn test_upstream_end_closes_stream() {
    let feed = ChangeFeed::new(Arc::new(MemoryUpstream::new()));
    let cancel = CancellationToken::new();
    let mut client = connect(&feed, &["orders"], &cancel).await;
    client.next_event().await;

    feed.close_all();
    assert_eq!(client.task.await.unwrap(), RelayOutcome::UpstreamEnded);
}
