use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{info, warn};

use crate::engine::analytics::MediaEvent;

use super::app_state::AppState;

/// POST /webhook/media: room and participant events from the media server.
/// The body hash must match the signed `Authorization` token.
pub async fn media_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = state.webhook_verifier.verify(authorization, &body) {
        warn!(error = %err, "failed to verify media webhook");
        return (StatusCode::UNAUTHORIZED, "Invalid webhook signature").into_response();
    }

    let event: MediaEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "malformed media webhook body");
            return (StatusCode::BAD_REQUEST, "Invalid webhook body").into_response();
        }
    };

    info!(
        event = %event.event,
        room = event.room.as_ref().map(|r| r.name.as_str()).unwrap_or(""),
        "media webhook received"
    );
    state.engine.apply_media_event(&event);
    Json(json!({ "status": "received" })).into_response()
}
