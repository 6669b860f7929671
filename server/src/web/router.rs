use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::warn;

use super::app_state::AppState;
use super::rate_limit::{admin_rate_limit, api_rate_limit, webhook_rate_limit, ws_rate_limit};
use super::{admin_api, rest_api, webhook, ws_handler};

/// Largest webhook body accepted.
const WEBHOOK_BODY_LIMIT: usize = 64 * 1024;

/// Build the axum router with all HTTP and WebSocket routes.
pub fn build_router(state: Arc<AppState>, allowed_origins: &[String]) -> Router {
    let rate_limiters = state.rate_limiters.clone();

    // WebSocket: connection rate limit
    let ws_routes = Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .layer(axum::middleware::from_fn(ws_rate_limit));

    let api_routes = Router::new()
        .route("/health", get(rest_api::health))
        .route("/api/rooms", get(rest_api::list_rooms))
        .layer(axum::middleware::from_fn(api_rate_limit));

    // Admin endpoints: password header plus IP allow-list, tight rate limit
    let admin_routes = Router::new()
        .route("/api/admin/stats", get(admin_api::stats))
        .route(
            "/api/admin/rooms",
            get(admin_api::list_rooms).post(admin_api::create_room),
        )
        .route("/api/admin/rooms/{id}/close", post(admin_api::close_room))
        .route("/api/admin/users/{id}/mute", post(admin_api::mute_user))
        .route("/api/admin/users/{id}/kick", post(admin_api::kick_user))
        .route("/api/admin/users/{id}/ban", post(admin_api::ban_user))
        .route("/api/admin/bans", get(admin_api::list_bans))
        .route("/api/admin/bans/{id}", delete(admin_api::delete_ban))
        .route("/api/admin/activity", get(admin_api::activity))
        .route("/api/admin/sessions", get(admin_api::sessions))
        .layer(axum::middleware::from_fn(admin_rate_limit));

    let webhook_routes = Router::new()
        .route("/webhook/media", post(webhook::media_webhook))
        .layer(RequestBodyLimitLayer::new(WEBHOOK_BODY_LIMIT))
        .layer(axum::middleware::from_fn(webhook_rate_limit));

    Router::new()
        .merge(ws_routes)
        .merge(api_routes)
        .merge(admin_routes)
        .merge(webhook_routes)
        .layer(cors_layer(allowed_origins))
        // Inject rate limiters into all request extensions
        .layer(axum::Extension(rate_limiters))
        .with_state(state)
}

/// `*` (or an empty list) allows any origin.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}
