//! Reference-counted fan-out of one upstream registration per table.
//!
//! `ChangeFeed` is the shared [`ChangeSource`] for every relay connection in
//! a process. The upstream is attached when the first subscriber shows
//! interest in a table and detached when the last one leaves.
//!
//! Delivery is at-most-once: each subscriber has a bounded buffer and an item
//! that does not fit is dropped with a warning. There is no replay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::source::{ChangeNotification, ChangeSource, FeedItem, SourceHandle};
use crate::topic::Topic;

/// Default per-subscriber buffer size
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

// ============================================================================
// Upstream trait
// ============================================================================

/// Registration of interest with the real change feed
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Start receiving changes for `table`
    async fn attach(&self, table: &str) -> Result<(), RelayError>;

    /// Stop receiving changes for `table`. Must not block; called with the
    /// feed's registry lock held.
    fn detach(&self, table: &str);

    /// Short name for logs and health output
    fn name(&self) -> &'static str;
}

/// Upstream with nothing behind it; changes arrive through `ChangeFeed::publish`
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn attach(&self, _table: &str) -> Result<(), RelayError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self, _table: &str) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// ChangeFeed
// ============================================================================

struct Subscriber {
    topics: Vec<Topic>,
    sender: mpsc::Sender<FeedItem>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Subscriber count per attached table
    tables: HashMap<String, usize>,
    subscribers: HashMap<u64, Subscriber>,
}

struct FeedInner {
    upstream: Arc<dyn Upstream>,
    registry: Mutex<Registry>,
    /// Serializes subscribe so no one sees a table whose attach is in flight
    attach_lock: tokio::sync::Mutex<()>,
    subscriber_buffer: usize,
}

impl FeedInner {
    /// Drop one reference per table; detach tables that reach zero.
    ///
    /// Detach is issued under the registry lock so upstream sees detach and
    /// re-attach in the same order the registry does.
    fn release_tables(&self, tables: &HashSet<String>) {
        let mut registry = self.registry.lock();
        for table in tables {
            if let Some(count) = registry.tables.get_mut(table) {
                *count -= 1;
                if *count == 0 {
                    registry.tables.remove(table);
                    info!(table = %table, upstream = self.upstream.name(), "Last subscriber left, detaching upstream");
                    self.upstream.detach(table);
                }
            }
        }
    }

    fn release_subscriber(&self, id: u64) {
        let removed = self.registry.lock().subscribers.remove(&id);
        if let Some(subscriber) = removed {
            let tables = subscriber.topics.iter().map(|t| t.table.clone()).collect();
            self.release_tables(&tables);
            debug!(subscriber_id = id, "Subscriber released");
        }
    }
}

/// Shared fan-out change source
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

impl ChangeFeed {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self::with_buffer(upstream, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(upstream: Arc<dyn Upstream>, subscriber_buffer: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                upstream,
                registry: Mutex::new(Registry::default()),
                attach_lock: tokio::sync::Mutex::new(()),
                subscriber_buffer: subscriber_buffer.max(1),
            }),
        }
    }

    pub fn upstream_name(&self) -> &'static str {
        self.inner.upstream.name()
    }

    /// Tables with at least one subscriber
    pub fn attached_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.inner.registry.lock().tables.keys().cloned().collect();
        tables.sort();
        tables
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().subscribers.len()
    }

    /// Route one raw upstream payload received for `table`.
    ///
    /// Returns how many subscribers the item was queued for.
    pub fn publish(&self, table: &str, raw: &str) -> usize {
        let item = match ChangeNotification::decode(table, raw) {
            Ok(notification) => FeedItem::Change(Arc::new(notification)),
            Err(e) => {
                warn!(table = %table, error = %e, "Malformed upstream notification");
                FeedItem::Malformed {
                    table: table.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let registry = self.inner.registry.lock();
        let mut delivered = 0;
        for (id, subscriber) in registry.subscribers.iter() {
            let wanted = match &item {
                FeedItem::Change(notification) => {
                    subscriber.topics.iter().any(|t| t.matches(notification))
                }
                FeedItem::Malformed { table, .. } => {
                    subscriber.topics.iter().any(|t| &t.table == table)
                }
            };
            if !wanted {
                continue;
            }

            match subscriber.sender.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber_id = id, table = %table, "Subscriber buffer full, dropping change");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Close every subscriber's stream, signalling that the upstream ended
    pub fn close_all(&self) {
        let mut registry = self.inner.registry.lock();
        for subscriber in registry.subscribers.values_mut() {
            // Swap in a sender whose receiver is already gone so the real channel closes
            let (closed, _) = mpsc::channel(1);
            subscriber.sender = closed;
        }
    }

    fn release_fn(&self, id: u64) -> impl FnOnce() + Send + Sync + 'static {
        let weak: Weak<FeedInner> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.release_subscriber(id);
            }
        }
    }
}

#[async_trait]
impl ChangeSource for ChangeFeed {
    async fn subscribe(&self, topics: &[Topic]) -> Result<SourceHandle, RelayError> {
        if topics.is_empty() {
            return Err(RelayError::upstream("no topics requested"));
        }

        let _attaching = self.inner.attach_lock.lock().await;

        let tables: HashSet<String> = topics.iter().map(|t| t.table.clone()).collect();

        // Reserve a reference on every table first; remember the new ones
        let fresh: Vec<String> = {
            let mut registry = self.inner.registry.lock();
            tables
                .iter()
                .filter_map(|table| {
                    let count = registry.tables.entry(table.clone()).or_insert(0);
                    *count += 1;
                    (*count == 1).then(|| table.clone())
                })
                .collect()
        };

        let fresh_set: HashSet<String> = fresh.iter().cloned().collect();
        let mut attached: HashSet<String> = tables.difference(&fresh_set).cloned().collect();
        for table in &fresh {
            if let Err(e) = self.inner.upstream.attach(table).await {
                warn!(table = %table, error = %e, "Upstream attach failed");
                // Attached tables get detached on release; the rest just lose the reservation
                self.inner.release_tables(&attached);
                let unattached: HashSet<String> = tables.difference(&attached).cloned().collect();
                self.forget_reservations(&unattached);
                return Err(match e {
                    RelayError::UpstreamUnavailable(_) => e,
                    other => RelayError::upstream(other.to_string()),
                });
            }
            info!(table = %table, upstream = self.inner.upstream.name(), "Upstream attached");
            attached.insert(table.clone());
        }

        let (sender, receiver) = mpsc::channel(self.inner.subscriber_buffer);
        let id = {
            let mut registry = self.inner.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.subscribers.insert(
                id,
                Subscriber {
                    topics: topics.to_vec(),
                    sender,
                },
            );
            id
        };

        debug!(subscriber_id = id, topics = ?topics.iter().map(|t| t.to_string()).collect::<Vec<_>>(), "Subscriber registered");
        Ok(SourceHandle::new(receiver, self.release_fn(id)))
    }
}

impl ChangeFeed {
    /// Undo reservations on tables whose attach never happened
    fn forget_reservations(&self, tables: &HashSet<String>) {
        let mut registry = self.inner.registry.lock();
        for table in tables {
            if let Some(count) = registry.tables.get_mut(table) {
                *count -= 1;
                if *count == 0 {
                    registry.tables.remove(table);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn topics(raw: &[&str]) -> Vec<Topic> {
        raw.iter().map(|t| t.parse().unwrap()).collect()
    }

    fn feed() -> (ChangeFeed, Arc<MemoryUpstream>) {
        let upstream = Arc::new(MemoryUpstream::new());
        (ChangeFeed::new(upstream.clone()), upstream)
    }

    async fn next_change(handle: &mut SourceHandle) -> Arc<ChangeNotification> {
        match tokio::time::timeout(Duration::from_secs(1), handle.recv()).await {
            Ok(Some(FeedItem::Change(n))) => n,
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_last_subscriber_releases_upstream() {
        let (feed, upstream) = feed();

        let mut first = feed.subscribe(&topics(&["orders"])).await.unwrap();
        let mut second = feed.subscribe(&topics(&["orders"])).await.unwrap();
        assert_eq!(upstream.attach_count(), 1);

        first.unsubscribe();
        assert_eq!(upstream.detach_count(), 0);
        assert_eq!(feed.attached_tables(), vec!["orders".to_string()]);

        second.unsubscribe();
        assert_eq!(upstream.detach_count(), 1);
        assert!(feed.attached_tables().is_empty());
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_routes_by_topic() {
        let (feed, _) = feed();
        let mut orders = feed.subscribe(&topics(&["orders"])).await.unwrap();
        let mut full_drums = feed.subscribe(&topics(&["drums:status=eq.full"])).await.unwrap();

        assert_eq!(feed.publish("orders", r#"{"type":"INSERT","record":{"id":1}}"#), 1);
        assert_eq!(
            feed.publish("drums", r#"{"type":"UPDATE","record":{"id":2,"status":"empty"}}"#),
            0
        );
        assert_eq!(
            feed.publish("drums", r#"{"type":"UPDATE","record":{"id":3,"status":"full"}}"#),
            1
        );

        assert_eq!(next_change(&mut orders).await.table, "orders");
        let drum = next_change(&mut full_drums).await;
        assert_eq!(drum.record.as_ref().unwrap()["id"], 3);
    }

    #[tokio::test]
    async fn test_overlapping_topics_deliver_once() {
        let (feed, upstream) = feed();
        let mut handle = feed
            .subscribe(&topics(&["orders", "orders:status=eq.open"]))
            .await
            .unwrap();
        assert_eq!(upstream.attach_count(), 1);

        feed.publish("orders", r#"{"type":"INSERT","record":{"id":1,"status":"open"}}"#);
        feed.publish("orders", r#"{"type":"INSERT","record":{"id":2,"status":"open"}}"#);

        assert_eq!(next_change(&mut handle).await.record.as_ref().unwrap()["id"], 1);
        assert_eq!(next_change(&mut handle).await.record.as_ref().unwrap()["id"], 2);
    }

    #[tokio::test]
    async fn test_malformed_reaches_table_subscribers() {
        let (feed, _) = feed();
        let mut handle = feed.subscribe(&topics(&["scans"])).await.unwrap();

        assert_eq!(feed.publish("scans", "{{garbage"), 1);
        assert!(matches!(
            handle.recv().await,
            Some(FeedItem::Malformed { ref table, .. }) if table == "scans"
        ));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_items() {
        let upstream = Arc::new(MemoryUpstream::new());
        let feed = ChangeFeed::with_buffer(upstream, 1);
        let _handle = feed.subscribe(&topics(&["orders"])).await.unwrap();

        assert_eq!(feed.publish("orders", r#"{"type":"INSERT","record":{"id":1}}"#), 1);
        assert_eq!(feed.publish("orders", r#"{"type":"INSERT","record":{"id":2}}"#), 0);
    }

    struct FailingUpstream {
        failing_table: &'static str,
        inner: MemoryUpstream,
    }

    #[async_trait]
    impl Upstream for FailingUpstream {
        async fn attach(&self, table: &str) -> Result<(), RelayError> {
            if table == self.failing_table {
                return Err(RelayError::upstream("listen refused"));
            }
            self.inner.attach(table).await
        }

        fn detach(&self, table: &str) {
            self.inner.detach(table)
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_failed_attach_rolls_back() {
        let upstream = Arc::new(FailingUpstream {
            failing_table: "drums",
            inner: MemoryUpstream::new(),
        });
        let feed = ChangeFeed::new(upstream.clone());

        let result = feed.subscribe(&topics(&["orders", "drums"])).await;
        assert!(matches!(result, Err(RelayError::UpstreamUnavailable(_))));
        assert!(feed.attached_tables().is_empty());
        assert_eq!(feed.subscriber_count(), 0);
        assert_eq!(
            upstream.inner.attach_count(),
            upstream.inner.detach_count()
        );
    }

    #[tokio::test]
    async fn test_empty_topics_rejected() {
        let (feed, _) = feed();
        assert!(matches!(
            feed.subscribe(&[]).await,
            Err(RelayError::UpstreamUnavailable(_))
        ));
    }

    /// Tracks what upstream believes is live; the first detach blocks until released
    struct GatedUpstream {
        listening: Mutex<HashSet<String>>,
        gate_armed: std::sync::atomic::AtomicBool,
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        resume: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    #[async_trait]
    impl Upstream for GatedUpstream {
        async fn attach(&self, table: &str) -> Result<(), RelayError> {
            self.listening.lock().insert(table.to_string());
            Ok(())
        }

        fn detach(&self, table: &str) {
            if self.gate_armed.swap(false, Ordering::SeqCst) {
                if let Some(entered) = self.entered.lock().take() {
                    let _ = entered.send(());
                }
                if let Some(resume) = self.resume.lock().take() {
                    let _ = resume.recv();
                }
            }
            self.listening.lock().remove(table);
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resubscribe_during_detach_keeps_upstream_attached() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel();
        let upstream = Arc::new(GatedUpstream {
            listening: Mutex::new(HashSet::new()),
            gate_armed: std::sync::atomic::AtomicBool::new(true),
            entered: Mutex::new(Some(entered_tx)),
            resume: Mutex::new(Some(resume_rx)),
        });
        let feed = ChangeFeed::new(upstream.clone());

        let first = feed.subscribe(&topics(&["orders"])).await.unwrap();
        let dropper = std::thread::spawn(move || drop(first));
        entered_rx.recv().unwrap();

        // Second subscriber arrives while the last one's detach is in progress
        let resubscribe = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.subscribe(&topics(&["orders"])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        resume_tx.send(()).unwrap();
        dropper.join().unwrap();

        let mut second = resubscribe.await.unwrap().unwrap();
        assert_eq!(feed.attached_tables(), vec!["orders".to_string()]);
        assert!(upstream.listening.lock().contains("orders"));

        assert_eq!(feed.publish("orders", r#"{"type":"INSERT","record":{"id":9}}"#), 1);
        assert_eq!(next_change(&mut second).await.record.as_ref().unwrap()["id"], 9);
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let (feed, _) = feed();
        let mut handle = feed.subscribe(&topics(&["orders"])).await.unwrap();
        feed.close_all();
        assert!(handle.recv().await.is_none());
    }
}
