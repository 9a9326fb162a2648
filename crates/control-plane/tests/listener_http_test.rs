// Listener against a real server over TCP
// Run with: cargo test -p depot-control-plane --test listener_http_test
// Exercises the reqwest + eventsource transport end to end on the in-memory source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use depot_control_plane::{build_app, ServerConfig};
use depot_core::{
    ChangeEvent, ChangeFeed, ChangeType, HttpTransport, Listener, ListenerError, ListenerState,
    MemoryUpstream, ReconnectPolicy, RelayError, Topic, Upstream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct RunningServer {
    base_url: String,
    feed: ChangeFeed,
    shutdown: CancellationToken,
}

async fn serve(feed: ChangeFeed) -> RunningServer {
    let config = ServerConfig {
        heartbeat_interval: Some(Duration::from_millis(100)),
        ..ServerConfig::default()
    };
    let shutdown = CancellationToken::new();
    let app = build_app(&config, feed.clone(), shutdown.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .unwrap();
    });

    RunningServer {
        base_url: format!("http://{}", addr),
        feed,
        shutdown,
    }
}

fn orders() -> Vec<Topic> {
    vec!["orders".parse().unwrap()]
}

/// Next event that is not transport chatter
async fn next_change(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("handler channel closed");
            if !matches!(event.event_type, ChangeType::Heartbeat | ChangeType::Connected) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for change")
}

async fn wait_for_subscribers(feed: &ChangeFeed, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while feed.subscriber_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

#[tokio::test]
async fn test_listener_receives_changes_over_http() {
    let server = serve(ChangeFeed::new(Arc::new(MemoryUpstream::new()))).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Listener::spawn(
        Arc::new(HttpTransport::new(&server.base_url)),
        orders(),
        move |event: ChangeEvent| {
            let _ = tx.send(event);
        },
        ReconnectPolicy::exponential(),
    );

    let state = tokio::time::timeout(Duration::from_secs(5), listener.wait_connected())
        .await
        .unwrap();
    assert_eq!(state, ListenerState::Connected);
    assert_eq!(server.feed.subscriber_count(), 1);

    assert_eq!(
        server.feed.publish("orders", r#"{"type":"INSERT","record":{"id":42,"status":"open"}}"#),
        1
    );
    let inserted = next_change(&mut rx).await;
    assert_eq!(inserted.event_type, ChangeType::Inserted);
    assert_eq!(inserted.payload.as_ref().unwrap()["id"], 42);

    server
        .feed
        .publish("orders", r#"{"type":"DELETE","old_record":{"id":42,"status":"open"}}"#);
    let deleted = next_change(&mut rx).await;
    assert_eq!(deleted.event_type, ChangeType::Deleted);
    assert!(deleted.timestamp >= inserted.timestamp);

    listener.close();
    assert_eq!(listener.state(), ListenerState::Closed);
    wait_for_subscribers(&server.feed, 0).await;
    assert!(server.feed.attached_tables().is_empty());

    server.shutdown.cancel();
}

struct DownUpstream;

#[async_trait]
impl Upstream for DownUpstream {
    async fn attach(&self, _table: &str) -> Result<(), RelayError> {
        Err(RelayError::upstream("database unreachable"))
    }

    fn detach(&self, _table: &str) {}

    fn name(&self) -> &'static str {
        "down"
    }
}

#[tokio::test]
async fn test_listener_fails_on_error_status() {
    let server = serve(ChangeFeed::new(Arc::new(DownUpstream))).await;

    let listener = Listener::spawn(
        Arc::new(HttpTransport::new(&server.base_url)),
        orders(),
        |_event: ChangeEvent| {},
        ReconnectPolicy::exponential()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_retries(Some(1)),
    );

    let state = tokio::time::timeout(Duration::from_secs(5), listener.wait_terminal())
        .await
        .unwrap();
    match state {
        ListenerState::Failed(ListenerError::RetriesExhausted { attempts, last_error }) => {
            assert_eq!(attempts, 2);
            assert!(last_error.contains("503"));
            assert!(last_error.contains("database unreachable"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    server.shutdown.cancel();
}
