// Event streaming HTTP routes (SSE)
// One Relay per request; the client going away drops the response stream,
// which the relay sees as a closed sink and tears down.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event as SseEvent, Sse},
    routing::get,
    Router,
};
use axum_extra::extract::{Query, QueryRejection};
use depot_core::{ChangeFeed, Frame, FrameSink, Relay, RelayConfig, RelayError, Topic};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use utoipa::IntoParams;

use super::common::{bad_request, service_unavailable, ApiError};

/// Frames buffered between the relay task and the HTTP body
const SSE_CHANNEL_CAPACITY: usize = 64;

/// Query parameters for the event stream
#[derive(Debug, Deserialize, IntoParams)]
pub struct StreamQuery {
    /// Topic to subscribe to; repeatable. `table` or `table:column=op.value`
    #[serde(default)]
    #[param(example = "orders")]
    pub topic: Vec<String>,
}

// ============================================
// App State and Routes
// ============================================

/// App state for events routes
#[derive(Clone)]
pub struct AppState {
    pub feed: ChangeFeed,
    pub relay_config: RelayConfig,
    /// Cancelled on server shutdown; every relay runs on a child token
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(feed: ChangeFeed, relay_config: RelayConfig, shutdown: CancellationToken) -> Self {
        Self {
            feed,
            relay_config,
            shutdown,
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/sse", get(stream_sse))
        .with_state(state)
}

// ============================================
// SSE sink
// ============================================

/// Writes frames into the response body channel
pub struct SseSink {
    tx: Option<mpsc::Sender<Result<SseEvent, Infallible>>>,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<Result<SseEvent, Infallible>>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl FrameSink for SseSink {
    async fn write(&mut self, frame: &Frame) -> Result<(), RelayError> {
        let tx = self.tx.as_ref().ok_or(RelayError::ClientDisconnected)?;
        tx.send(Ok(SseEvent::default().data(frame.json())))
            .await
            .map_err(|_| RelayError::ClientDisconnected)
    }

    async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }

    fn close(&mut self) {
        // Dropping the sender ends the response body
        self.tx = None;
    }
}

// ============================================
// HTTP Handlers
// ============================================

/// Parse and validate requested topics
fn parse_topics(raw: &[String]) -> Result<Vec<Topic>, ApiError> {
    if raw.is_empty() {
        return Err(bad_request("at least one topic is required"));
    }
    raw.iter()
        .map(|t| {
            t.parse::<Topic>()
                .map_err(|e| bad_request(format!("invalid topic '{}': {}", t, e)))
        })
        .collect()
}

/// Malformed query strings get the same JSON error body as invalid topics
fn query_rejected(rejection: QueryRejection) -> ApiError {
    bad_request(format!("invalid query string: {}", rejection))
}

/// GET /v1/sse - Stream row change events for the requested topics
#[utoipa::path(
    get,
    path = "/v1/sse",
    params(StreamQuery),
    responses(
        (status = 200, description = "Event stream; each frame is `data: <ChangeEvent JSON>`", content_type = "text/event-stream", body = depot_core::ChangeEvent),
        (status = 400, description = "Missing or invalid topic", body = super::ErrorResponse),
        (status = 503, description = "Change source unavailable", body = super::ErrorResponse)
    ),
    tag = "events"
)]
pub async fn stream_sse(
    State(state): State<AppState>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Sse<ReceiverStream<Result<SseEvent, Infallible>>>, ApiError> {
    let Query(query) = query.map_err(query_rejected)?;
    let topics = parse_topics(&query.topic)?;

    let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
    let relay = Relay::open(
        &state.feed,
        &topics,
        SseSink::new(tx),
        state.relay_config.clone(),
    )
    .await
    .map_err(|e| {
        tracing::warn!(error = %e, topics = ?query.topic, "Rejecting stream");
        service_unavailable(e.to_string())
    })?;

    tracing::info!(connection_id = %relay.connection_id(), topics = ?query.topic, "Starting event stream");

    let cancel = state.shutdown.child_token();
    tokio::spawn(relay.run(cancel));

    Ok(Sse::new(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topics() {
        let topics = parse_topics(&["orders".to_string(), "drums:status=eq.full".to_string()]).unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[1].table, "drums");
    }

    #[test]
    fn test_parse_topics_rejects_empty_and_invalid() {
        let (status, body) = parse_topics(&[]).unwrap_err();
        assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
        assert!(body.error.contains("topic"));

        let (status, _) = parse_topics(&["orders;drop".to_string()]).unwrap_err();
        assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[derive(Debug, Deserialize)]
    struct Numeric {
        #[allow(dead_code)]
        n: u32,
    }

    #[tokio::test]
    async fn test_query_rejection_is_json_bad_request() {
        use axum::extract::FromRequestParts;

        let (mut parts, _) = axum::http::Request::builder()
            .uri("/v1/sse?n=abc")
            .body(())
            .unwrap()
            .into_parts();
        let rejection = Query::<Numeric>::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();

        let (status, body) = query_rejected(rejection);
        assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
        assert!(body.error.starts_with("invalid query string"));
    }

    #[tokio::test]
    async fn test_sink_reports_disconnect() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = SseSink::new(tx);
        drop(rx);

        sink.closed().await;
        let event = depot_core::ChangeEvent::heartbeat(depot_core::MonotonicClock::new().now());
        let frame = Frame::encode(&event).unwrap();
        assert_eq!(sink.write(&frame).await, Err(RelayError::ClientDisconnected));
    }
}
