// Router assembly
// Decision: Health and docs are never prefixed; API routes honor API_PREFIX
// Decision: The publish route is only mounted in dev mode

use axum::http::{header, HeaderValue, Method};
use axum::Router;
use depot_core::ChangeFeed;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api;
use crate::config::ServerConfig;
use crate::openapi::ApiDoc;

/// Build the full application router
pub fn build_app(config: &ServerConfig, feed: ChangeFeed, shutdown: CancellationToken) -> Router {
    let health_state = api::health::HealthState {
        source: feed.upstream_name(),
    };
    let events_state = api::events::AppState::new(feed.clone(), config.relay_config(), shutdown);

    let mut api_routes = Router::new().merge(api::events::routes(events_state));
    if config.is_dev_mode() {
        api_routes = api_routes.merge(api::changes::routes(api::changes::AppState::new(feed)));
    }

    if !config.api_prefix.is_empty() {
        tracing::info!(prefix = %config.api_prefix, "API prefix configured");
    }

    let app = Router::new()
        .merge(api::health::routes(health_state))
        .merge(build_router_with_prefix(api_routes, &config.api_prefix))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()));

    let cors_origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let app = if cors_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
        app
    } else {
        tracing::info!(origins = ?cors_origins, "CORS origins configured");
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::ORIGIN,
                    header::CACHE_CONTROL,
                ])
                .allow_credentials(true),
        )
    };

    app.layer(TraceLayer::new_for_http())
}

/// Build router with optional API prefix (extracted for testing)
pub fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}
