use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Serialize;

use super::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub rooms: usize,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        connections: state.engine.registry().len(),
        rooms: state.engine.list_all_rooms().len(),
    })
}

/// GET /api/rooms: public, open rooms with visible counts.
pub async fn list_rooms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.list_rooms())
}
