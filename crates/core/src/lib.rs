// Depot Relay Core
//
// This crate provides the DB-agnostic pieces of the live-update relay:
// the change event model, topic parsing, the shared change feed, the
// per-connection relay and the client listener.
//
// Key design decisions:
// - Uses traits (ChangeSource, Upstream, FrameSink, EventTransport) for pluggable backends
// - One upstream attachment per table, reference counted across subscribers
// - Delivery is at-most-once; a slow subscriber loses events rather than stalling others
// - Relay teardown and listener close are idempotent

pub mod backoff;
pub mod error;
pub mod events;
pub mod feed;
pub mod frame;
pub mod listener;
pub mod relay;
pub mod source;
pub mod topic;

// Re-exports for convenience
pub use backoff::{ReconnectPolicy, MIN_RECONNECT_DELAY};
pub use error::{DecodeError, RelayError, Result};
pub use events::{ChangeEvent, ChangeType, MonotonicClock};
pub use feed::{ChangeFeed, MemoryUpstream, Upstream, DEFAULT_SUBSCRIBER_BUFFER};
pub use frame::{Frame, FrameDecoder};
pub use listener::{
    EventHandler, EventStream, EventTransport, HttpTransport, Listener, ListenerError,
    ListenerState,
};
pub use relay::{FrameSink, Relay, RelayConfig, RelayOutcome, DEFAULT_HEARTBEAT_INTERVAL};
pub use source::{ChangeKind, ChangeNotification, ChangeSource, FeedItem, SourceHandle};
pub use topic::{Filter, FilterOp, Topic, TopicError};
