use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::auth::admin::AdminAuthError;
use crate::engine::error::{EngineError, ErrorClass};
use crate::engine::room::{RoomOwner, RoomType};
use crate::engine::room_service::CreateRoom;

use super::app_state::AppState;
use super::rate_limit::client_ip;

/// Header carrying the shared admin secret.
pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";

const DEFAULT_ACTIVITY_LIMIT: usize = 100;
const DEFAULT_BAN_MINUTES: i64 = 60;

/// JSON error body: `{"code": ..., "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "code": self.code, "message": self.message })),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err.class() {
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Forbidden => StatusCode::FORBIDDEN,
            ErrorClass::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ErrorClass::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<AdminAuthError> for ApiError {
    fn from(err: AdminAuthError) -> Self {
        let (status, code) = match err {
            AdminAuthError::InvalidPassword => (StatusCode::UNAUTHORIZED, "INVALID_PASSWORD"),
            AdminAuthError::IpNotAllowed => (StatusCode::FORBIDDEN, "IP_NOT_ALLOWED"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

/// Extractor that admits a request only if it carries the admin password
/// and comes from an allowed address.
pub struct AdminGuard {
    pub ip: String,
}

impl FromRequestParts<Arc<AppState>> for AdminGuard {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0);
        let ip = client_ip(peer, &parts.headers);
        let password = parts
            .headers
            .get(ADMIN_PASSWORD_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if let Err(err) = state.engine.admin_auth().authenticate(&ip, password) {
            warn!(%ip, error = %err, "admin request rejected");
            return Err(err.into());
        }
        Ok(AdminGuard { ip })
    }
}

// ── Read endpoints ──────────────────────────────────────

/// GET /api/admin/stats
pub async fn stats(State(state): State<Arc<AppState>>, _admin: AdminGuard) -> impl IntoResponse {
    Json(state.engine.stats())
}

/// GET /api/admin/rooms: every room, raw counts.
pub async fn list_rooms(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
) -> impl IntoResponse {
    Json(state.engine.list_all_rooms())
}

#[derive(Deserialize)]
pub struct ActivityParams {
    pub limit: Option<usize>,
}

/// GET /api/admin/activity?limit=N: newest first.
pub async fn activity(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
    Query(params): Query<ActivityParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Json(state.engine.recent_activity(limit))
}

#[derive(Serialize)]
struct SessionsResponse {
    active: Vec<crate::engine::analytics::RoomSession>,
    finished: Vec<crate::engine::analytics::RoomSession>,
}

/// GET /api/admin/sessions: media server room sessions.
pub async fn sessions(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
) -> impl IntoResponse {
    let (active, finished) = state.engine.media_sessions();
    Json(SessionsResponse { active, finished })
}

/// GET /api/admin/bans: active bans.
pub async fn list_bans(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
) -> impl IntoResponse {
    Json(state.engine.list_bans())
}

// ── Mutations ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRoomBody {
    pub name: String,
    #[serde(default, rename = "type")]
    pub room_type: RoomType,
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// POST /api/admin/rooms: create an admin-owned room (never reaped).
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
    Json(body): Json<CreateRoomBody>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.engine.admin_create_room(CreateRoom {
        name: body.name,
        room_type: body.room_type,
        capacity: body.capacity,
        created_by: RoomOwner::Admin,
    })?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// POST /api/admin/rooms/{id}/close
pub async fn close_room(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.admin_close_room(&room_id)?))
}

#[derive(Deserialize)]
pub struct MuteBody {
    #[serde(default = "default_true")]
    pub muted: bool,
}

fn default_true() -> bool {
    true
}

/// POST /api/admin/users/{id}/mute
pub async fn mute_user(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
    Path(user_id): Path<String>,
    Json(body): Json<MuteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.engine.admin_mute(&user_id, body.muted)?;
    Ok(Json(user.info()))
}

#[derive(Deserialize, Default)]
pub struct KickBody {
    #[serde(default)]
    pub reason: String,
}

/// POST /api/admin/users/{id}/kick
pub async fn kick_user(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
    Path(user_id): Path<String>,
    Json(body): Json<KickBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.admin_kick(&user_id, &body.reason)?;
    Ok(Json(json!({ "status": "kicked", "user_id": user_id })))
}

#[derive(Deserialize)]
pub struct BanBody {
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_ban_minutes")]
    pub duration_minutes: i64,
}

fn default_ban_minutes() -> i64 {
    DEFAULT_BAN_MINUTES
}

/// POST /api/admin/users/{id}/ban
pub async fn ban_user(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
    Path(user_id): Path<String>,
    Json(body): Json<BanBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ban = state
        .engine
        .admin_ban(&user_id, &body.reason, body.duration_minutes)?;
    Ok((StatusCode::CREATED, Json(ban)))
}

/// DELETE /api/admin/bans/{id}
pub async fn delete_ban(
    State(state): State<Arc<AppState>>,
    _admin: AdminGuard,
    Path(ban_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.delete_ban(&ban_id)?))
}
