// OpenAPI specification generation
//
// This module defines the OpenAPI spec for the Depot relay API.
// It is used by both the server (for Swagger UI) and the export-openapi
// binary (for static spec generation).

use crate::api;
use depot_core::{ChangeEvent, ChangeKind, ChangeNotification, ChangeType};
use utoipa::OpenApi;

/// OpenAPI documentation for the Depot relay API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::events::stream_sse,
        api::changes::publish_change,
        api::health::health,
    ),
    components(
        schemas(
            ChangeEvent, ChangeType,
            ChangeNotification, ChangeKind,
            api::changes::PublishResponse,
            api::health::HealthResponse,
            api::ErrorResponse,
        )
    ),
    tags(
        (name = "events", description = "Live change streaming (SSE)"),
        (name = "changes", description = "Change injection (dev mode only)"),
        (name = "health", description = "Health check")
    ),
    info(
        title = "Depot Relay API",
        version = "0.2.0",
        description = "Live row-change notifications for Depot clients",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}
