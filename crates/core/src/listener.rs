// Client Listener
//
// Consumes a relay stream, hands each ChangeEvent to a caller-supplied
// handler and reconnects with backoff when the transport drops.
//
// State machine:
//   Disconnected -> Connecting -> Connected -> Disconnected -> ...
//   any state    -> Closed   (explicit close, terminal)
//   any state    -> Failed   (retry ceiling exceeded, terminal)

use std::cell::Cell;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::ReentrantMutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::events::{ChangeEvent, ChangeType};
use crate::topic::Topic;

// ============================================================================
// Errors and state
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListenerError {
    /// Could not reach the relay
    #[error("connect failed: {0}")]
    Connect(String),

    /// Relay answered with a non-success status
    #[error("relay returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Stream broke or ended after it was established
    #[error("stream error: {0}")]
    Stream(String),

    /// Retry ceiling exceeded
    #[error("gave up after {attempts} consecutive failed attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Not connected; a reconnect is pending unless the state is about to go terminal
    Disconnected,
    /// Handshake in flight, `connected` event not yet seen
    Connecting,
    /// `connected` event received
    Connected,
    /// Closed by the caller
    Closed,
    /// Gave up reconnecting
    Failed(ListenerError),
}

impl ListenerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ListenerState::Closed | ListenerState::Failed(_))
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Stream of frame bodies (JSON text), one per event
pub type EventStream = BoxStream<'static, Result<String, ListenerError>>;

/// Opens one stream to the relay
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    async fn connect(&self, topics: &[Topic]) -> Result<EventStream, ListenerError>;
}

/// Transport over `GET {base_url}/v1/sse?topic=...`
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn stream_url(&self) -> String {
        format!("{}/v1/sse", self.base_url)
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn connect(&self, topics: &[Topic]) -> Result<EventStream, ListenerError> {
        let query: Vec<(&str, String)> = topics.iter().map(|t| ("topic", t.to_string())).collect();

        let response = self
            .http
            .get(self.stream_url())
            .query(&query)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ListenerError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ListenerError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response
            .bytes_stream()
            .eventsource()
            .map(|result| match result {
                Ok(event) => Ok(event.data),
                Err(e) => Err(ListenerError::Stream(e.to_string())),
            });
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Receives events in the order the relay wrote them
pub trait EventHandler: Send + Sync + 'static {
    fn on_event(&self, event: ChangeEvent);
}

impl<F> EventHandler for F
where
    F: Fn(ChangeEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: ChangeEvent) {
        self(event)
    }
}

// ============================================================================
// Listener
// ============================================================================

struct Shared {
    /// `true` while open. Held during every handler call and state change so
    /// `close` cannot interleave with either. Reentrant so the handler may
    /// call `close` itself.
    gate: ReentrantMutex<Cell<bool>>,
    cancel: CancellationToken,
    state: watch::Sender<ListenerState>,
}

impl Shared {
    /// Apply a non-terminal transition; `false` once closed
    fn transition(&self, next: ListenerState) -> bool {
        let gate = self.gate.lock();
        if !gate.get() {
            return false;
        }
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "Listener state change");
            *current = next;
            true
        });
        true
    }

    fn fail(&self, error: ListenerError) {
        let gate = self.gate.lock();
        if !gate.get() {
            return;
        }
        gate.set(false);
        self.cancel.cancel();
        warn!(error = %error, "Listener giving up");
        self.state.send_replace(ListenerState::Failed(error));
    }

    fn close(&self) {
        let gate = self.gate.lock();
        if !gate.get() {
            return;
        }
        gate.set(false);
        self.cancel.cancel();
        self.state.send_replace(ListenerState::Closed);
    }

    /// Invoke the handler unless closed; `false` once closed
    fn deliver(&self, handler: &dyn EventHandler, event: ChangeEvent) -> bool {
        let gate = self.gate.lock();
        if !gate.get() {
            return false;
        }
        handler.on_event(event);
        gate.get()
    }
}

/// Handle to a running listener task
pub struct Listener {
    shared: Arc<Shared>,
}

impl Listener {
    /// Start listening on `topics`. Must be called inside a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn EventTransport>,
        topics: Vec<Topic>,
        handler: impl EventHandler,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        let shared = Arc::new(Shared {
            gate: ReentrantMutex::new(Cell::new(true)),
            cancel: CancellationToken::new(),
            state,
        });

        let worker = Worker {
            shared: shared.clone(),
            transport,
            topics,
            handler: Box::new(handler),
            policy,
        };
        tokio::spawn(worker.run());

        Self { shared }
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn state_changes(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Whether the handler can no longer be invoked, after `close` or a
    /// terminal failure. Check `state()` to tell the two apart.
    pub fn is_stopped(&self) -> bool {
        !self.shared.gate.lock().get()
    }

    /// Stop listening. Idempotent.
    ///
    /// Once this returns the handler will not be invoked again, including
    /// when it is called from inside the handler. An in-flight connect or
    /// backoff wait is abandoned.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Wait until the listener reaches `Closed` or `Failed`
    pub async fn wait_terminal(&self) -> ListenerState {
        let mut changes = self.state_changes();
        let terminal = changes.wait_for(|state| state.is_terminal()).await;
        match terminal {
            Ok(state) => state.clone(),
            // Sender lives in `shared`, which we hold
            Err(_) => self.state(),
        }
    }

    /// Wait until the next `Connected` state (or a terminal one)
    pub async fn wait_connected(&self) -> ListenerState {
        let mut changes = self.state_changes();
        let reached = changes
            .wait_for(|state| *state == ListenerState::Connected || state.is_terminal())
            .await;
        match reached {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.close();
    }
}

struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn EventTransport>,
    topics: Vec<Topic>,
    handler: Box<dyn EventHandler>,
    policy: ReconnectPolicy,
}

/// How one connection attempt ended
struct AttemptEnd {
    reached_connected: bool,
    error: Option<ListenerError>,
}

impl Worker {
    async fn run(self) {
        let cancel = self.shared.cancel.clone();
        let mut failures: u32 = 0;

        loop {
            if !self.shared.transition(ListenerState::Connecting) {
                return;
            }

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = self.transport.connect(&self.topics) => result,
            };

            let end = match connected {
                Ok(stream) => self.pump(stream, &cancel).await,
                Err(e) => AttemptEnd {
                    reached_connected: false,
                    error: Some(e),
                },
            };
            if cancel.is_cancelled() {
                return;
            }

            let last_error = end
                .error
                .unwrap_or_else(|| ListenerError::Stream("stream ended".to_string()));
            failures = if end.reached_connected { 1 } else { failures + 1 };

            if !self.policy.has_retries_remaining(failures) {
                self.shared.fail(ListenerError::RetriesExhausted {
                    attempts: failures,
                    last_error: last_error.to_string(),
                });
                return;
            }

            if !self.shared.transition(ListenerState::Disconnected) {
                return;
            }
            let delay = self.policy.delay_for_attempt(failures);
            info!(error = %last_error, delay_ms = delay.as_millis() as u64, failures, "Listener disconnected, reconnecting");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&self, mut stream: EventStream, cancel: &CancellationToken) -> AttemptEnd {
        let mut reached_connected = false;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };

            let data = match item {
                None => {
                    return AttemptEnd {
                        reached_connected,
                        error: None,
                    }
                }
                Some(None) => {
                    return AttemptEnd {
                        reached_connected,
                        error: Some(ListenerError::Stream("server ended stream".to_string())),
                    }
                }
                Some(Some(Err(e))) => {
                    return AttemptEnd {
                        reached_connected,
                        error: Some(e),
                    }
                }
                Some(Some(Ok(data))) => data,
            };

            let event = match ChangeEvent::parse(&data) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable event");
                    continue;
                }
            };

            if event.event_type == ChangeType::Connected && !reached_connected {
                reached_connected = true;
                if !self.shared.transition(ListenerState::Connected) {
                    return AttemptEnd {
                        reached_connected,
                        error: None,
                    };
                }
            }

            if !self.shared.deliver(self.handler.as_ref(), event) {
                return AttemptEnd {
                    reached_connected,
                    error: None,
                };
            }
        }
    }
}
