// Change injection route (dev mode only)
// Stands in for the database trigger when the server runs on the in-memory source.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use depot_core::{ChangeFeed, ChangeNotification, Topic};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::common::{bad_request, ApiError};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PublishResponse {
    /// Open streams the change was queued for
    pub delivered: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub feed: ChangeFeed,
}

impl AppState {
    pub fn new(feed: ChangeFeed) -> Self {
        Self { feed }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/changes/:table", post(publish_change))
        .with_state(state)
}

/// POST /v1/changes/{table} - Publish a row change to connected streams
#[utoipa::path(
    post,
    path = "/v1/changes/{table}",
    params(
        ("table" = String, Path, description = "Table the change belongs to")
    ),
    request_body = ChangeNotification,
    responses(
        (status = 202, description = "Change accepted", body = PublishResponse),
        (status = 400, description = "Invalid table or notification", body = super::ErrorResponse)
    ),
    tag = "changes"
)]
pub async fn publish_change(
    State(state): State<AppState>,
    Path(table): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    Topic::table(table.as_str()).map_err(|e| bad_request(e.to_string()))?;
    ChangeNotification::decode(&table, &body).map_err(|e| bad_request(e.to_string()))?;

    let delivered = state.feed.publish(&table, &body);
    tracing::debug!(table = %table, delivered, "Published change");

    Ok((StatusCode::ACCEPTED, Json(PublishResponse { delivered })))
}
