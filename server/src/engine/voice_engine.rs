use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::admin::AdminAuth;
use crate::auth::media_token::{CredentialIssuer, CredentialRequest, Grants};

use super::activity::{ActivityEntry, ActivityLedger};
use super::analytics::{MediaEvent, RoomSession, RoomSessionLedger};
use super::ban::{Ban, BanLedger};
use super::chat::{ChatLedger, ChatMessage, DEFAULT_HISTORY_LIMIT};
use super::error::EngineError;
use super::events::{
    ChatMessageRequest, ClientMessage, ConnectionId, GetRoomRequest, JoinRoomRequest,
    ReactionRequest, RoomInfo, RoomJoined, RoomSummary, ServerEvent,
};
use super::moderation::{Moderator, Stats};
use super::presence;
use super::rate_limiter::RateLimiter;
use super::registry::{Connection, ConnectionRegistry};
use super::room::{DEFAULT_ROOM_CAPACITY, Room, RoomOwner, RoomType};
use super::room_service::{CreateRoom, JoinOutcome, JoinRequest, RoomLookup, RoomService};
use super::room_store::RoomStore;
use super::user::{User, UserStore};
use super::validation;

/// Name recorded as the actor for admin actions.
const ADMIN_ACTOR: &str = "admin";

/// Rate limiter buckets idle this long are dropped by the log reaper.
const LIMITER_IDLE: Duration = Duration::from_secs(3600);

/// Tunables the engine reads at runtime. Built from the config file.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_capacity: usize,
    pub history_limit: usize,
    pub max_message_length: usize,
    pub presence_interval: Duration,
    pub chat_retention: chrono::Duration,
    pub activity_retention: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_ROOM_CAPACITY,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_message_length: validation::MAX_MESSAGE_LENGTH,
            presence_interval: Duration::from_secs(5),
            chat_retention: chrono::Duration::hours(24),
            activity_retention: chrono::Duration::hours(48),
        }
    }
}

/// The central hub that owns all room state and every live connection.
/// Protocol-agnostic: the WebSocket handler and the admin API both call in.
pub struct VoiceEngine {
    rooms: Arc<RoomStore>,
    users: Arc<UserStore>,
    bans: Arc<BanLedger>,
    activity: Arc<ActivityLedger>,
    chat: ChatLedger,
    sessions: RoomSessionLedger,
    room_service: RoomService,
    moderator: Moderator,
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<dyn CredentialIssuer>,
    admin_auth: AdminAuth,
    /// Per-user chat limiter (burst of 10, refill 1 per second).
    chat_limiter: RateLimiter,
    settings: EngineSettings,
}

impl VoiceEngine {
    pub fn new(
        credentials: Arc<dyn CredentialIssuer>,
        admin_auth: AdminAuth,
        settings: EngineSettings,
    ) -> Self {
        let rooms = Arc::new(RoomStore::new());
        let users = Arc::new(UserStore::new());
        let bans = Arc::new(BanLedger::new());
        let activity = Arc::new(ActivityLedger::new());
        let room_service = RoomService::new(
            rooms.clone(),
            users.clone(),
            bans.clone(),
            activity.clone(),
            settings.default_capacity,
        );
        let moderator = Moderator::new(rooms.clone(), users.clone(), bans.clone(), activity.clone());

        Self {
            rooms,
            users,
            bans,
            activity,
            chat: ChatLedger::new(settings.history_limit),
            sessions: RoomSessionLedger::new(),
            room_service,
            moderator,
            registry: Arc::new(ConnectionRegistry::new()),
            credentials,
            admin_auth,
            chat_limiter: RateLimiter::new(10, 1.0),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn admin_auth(&self) -> &AdminAuth {
        &self.admin_auth
    }

    pub fn chat(&self) -> &ChatLedger {
        &self.chat
    }

    /// Create an admin-owned public room unless one with that name exists.
    /// Used at startup for the lobby.
    pub fn ensure_room(&self, name: &str, capacity: usize) -> Result<Arc<Room>, EngineError> {
        if let Some(room) = self.rooms.get_by_name(name) {
            return Ok(room);
        }
        match self.room_service.create_room(CreateRoom {
            name: name.to_string(),
            room_type: RoomType::Public,
            capacity: Some(capacity),
            created_by: RoomOwner::Admin,
        }) {
            Ok(room) => Ok(room),
            Err(EngineError::DuplicateRoomName(_)) => {
                self.rooms.get_by_name(name).ok_or(EngineError::RoomNotFound)
            }
            Err(err) => Err(err),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Register a new connection and greet it.
    pub fn connect(&self, ip: &str) -> (Arc<Connection>, mpsc::Receiver<ServerEvent>) {
        let (conn, rx) = Connection::new(ip);
        let conn = Arc::new(conn);
        self.registry.register(conn.clone());
        conn.send(ServerEvent::Connected {
            message: "Connected to voice chat server".into(),
            user_id: conn.user_id.clone(),
        });
        info!(conn_id = %conn.id, user_id = %conn.user_id, %ip, "client connected");
        (conn, rx)
    }

    /// Tear down a connection: leave its room as if it had asked to, then
    /// drop it from the registry.
    pub fn disconnect(&self, conn_id: ConnectionId) {
        let Some(conn) = self.registry.get(conn_id) else {
            return;
        };
        self.leave_current_room(&conn);
        self.registry.unregister(conn_id);
        self.chat_limiter.forget(&conn.user_id);
        info!(%conn_id, user_id = %conn.user_id, "client disconnected");
    }

    /// Decode a text frame and dispatch it. Decode failures go back to the
    /// sender as `error` events.
    pub fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        match ClientMessage::decode(text) {
            Ok(msg) => self.handle_message(conn, msg),
            Err(err) => {
                debug!(conn_id = %conn.id, error = %err, "undecodable message");
                conn.send(ServerEvent::from(&err));
            }
        }
    }

    pub fn handle_message(&self, conn: &Arc<Connection>, msg: ClientMessage) {
        let result = match msg {
            ClientMessage::JoinRoom(req) => self.handle_join(conn, req),
            ClientMessage::LeaveRoom => {
                self.leave_current_room(conn);
                Ok(())
            }
            ClientMessage::ListRooms => {
                conn.send(ServerEvent::RoomList {
                    rooms: self.list_rooms(),
                });
                Ok(())
            }
            ClientMessage::GetRoom(req) => self.handle_get_room(conn, req),
            ClientMessage::ChatMessage(req) => self.handle_chat(conn, req),
            ClientMessage::ChatReactionAdd(req) => self.handle_reaction(conn, req, true),
            ClientMessage::ChatReactionRemove(req) => self.handle_reaction(conn, req, false),
            ClientMessage::Ping => {
                conn.send(ServerEvent::Pong);
                Ok(())
            }
            ClientMessage::Pong => Ok(()),
            ClientMessage::AdminAuth(req) => {
                self.handle_admin_auth(conn, &req.password);
                Ok(())
            }
            ClientMessage::MuteSelf(req) => self.handle_mute_self(conn, req.muted),
        };

        if let Err(err) = result {
            debug!(conn_id = %conn.id, code = err.code(), error = %err, "request failed");
            conn.send(ServerEvent::from(&err));
        }
    }

    // ── Rooms ───────────────────────────────────────────────────────

    fn handle_join(&self, conn: &Arc<Connection>, req: JoinRoomRequest) -> Result<(), EngineError> {
        if self.registry.room_of(conn.id).is_some() {
            return Err(EngineError::UserAlreadyInRoom);
        }

        let is_admin = conn.is_admin();
        let JoinOutcome {
            room,
            user,
            participants,
            is_new_room,
        } = self.room_service.join(JoinRequest {
            room_name: &req.room_name,
            user_id: &conn.user_id,
            user_name: &req.user_name,
            voice_mode: req.voice_mode,
            ip: &conn.ip,
            is_admin,
            stealth: req.stealth && is_admin,
        })?;

        let credential = match self.credentials.issue(&CredentialRequest {
            room_name: &room.name,
            user_id: &user.id,
            user_name: &user.name,
            grants: Grants::for_participant(user.is_admin, user.is_stealth),
        }) {
            Ok(token) => token,
            Err(err) => {
                error!(user_id = %user.id, room = %room.name, error = %err, "failed to issue join credential");
                self.roll_back_join(&user, &room);
                return Err(EngineError::Credential(err.to_string()));
            }
        };

        let Some((epoch, occupancy)) = self.registry.enter_room(conn.id, &room.id) else {
            warn!(conn_id = %conn.id, "connection closed during join");
            self.roll_back_join(&user, &room);
            return Ok(());
        };

        conn.send(ServerEvent::RoomJoined(RoomJoined {
            room_id: room.id.clone(),
            room_name: room.name.clone(),
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            join_credential: credential,
            media_server_url: self.credentials.media_server_url().to_string(),
            participants: participants.iter().map(|p| p.info()).collect(),
            is_new_room,
        }));
        conn.send(ServerEvent::ChatHistory {
            messages: self.chat.recent(&room.id, self.settings.history_limit),
        });

        presence::observe_and_notify(conn, occupancy);
        presence::spawn_presence_watch(
            self.registry.clone(),
            conn.clone(),
            room.id.clone(),
            epoch,
            self.settings.presence_interval,
        );

        if !user.is_stealth {
            let notice = ChatMessage::system(&room.id, &user.id, &user.name, "joined the room");
            self.chat.append(notice.clone());
            self.registry.broadcast_to_room(
                &room.id,
                &ServerEvent::UserJoined {
                    room_id: room.id.clone(),
                    user_id: user.id.clone(),
                    user_name: user.name.clone(),
                    participant: user.info(),
                },
                Some(conn.id),
            );
            self.registry.broadcast_to_room(
                &room.id,
                &ServerEvent::ChatMessage { message: notice },
                None,
            );
        }

        self.broadcast_room_list();
        Ok(())
    }

    fn roll_back_join(&self, user: &User, room: &Room) {
        if let Err(err) = self.room_service.leave(&user.id, &room.id) {
            warn!(user_id = %user.id, room = %room.name, error = %err, "join rollback failed");
        }
    }

    /// Leave whatever room the connection is in. A no-op in the lobby.
    ///
    /// If the aggregate no longer knows about the membership (a kick or close
    /// got there first) the registry is still detached and `room_left` sent.
    fn leave_current_room(&self, conn: &Connection) {
        let Some(room_id) = self.registry.room_of(conn.id) else {
            return;
        };

        let outcome = self.room_service.leave(&conn.user_id, &room_id);
        self.registry.leave_room(conn.id);
        conn.reset_presence();

        match outcome {
            Ok(outcome) => {
                let user = &outcome.user;
                if !user.is_stealth {
                    let notice = ChatMessage::system(&room_id, &user.id, &user.name, "left the room");
                    self.chat.append(notice.clone());
                    self.registry.broadcast_to_room(
                        &room_id,
                        &ServerEvent::ChatMessage { message: notice },
                        None,
                    );
                    self.registry.broadcast_to_room(
                        &room_id,
                        &ServerEvent::UserLeft {
                            room_id: room_id.clone(),
                            user_id: user.id.clone(),
                            user_name: user.name.clone(),
                        },
                        None,
                    );
                }
            }
            Err(err) => {
                warn!(conn_id = %conn.id, %room_id, error = %err, "leave found no membership");
            }
        }

        conn.send(ServerEvent::RoomLeft);
        self.broadcast_room_list();
    }

    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        self.room_service.list_rooms()
    }

    pub fn list_all_rooms(&self) -> Vec<RoomSummary> {
        self.room_service.list_all_rooms()
    }

    fn handle_get_room(&self, conn: &Connection, req: GetRoomRequest) -> Result<(), EngineError> {
        let lookup = match (&req.room_id, &req.room_name) {
            (Some(id), _) if !id.is_empty() => RoomLookup::Id(id),
            (_, Some(name)) if !name.is_empty() => RoomLookup::Name(name),
            _ => {
                return Err(EngineError::Validation(
                    "room_id or room_name is required".into(),
                ));
            }
        };
        let info = self.room_service.get_room(lookup, conn.is_admin())?;
        conn.send(ServerEvent::RoomInfo(info));
        Ok(())
    }

    /// Push the current public room list to every connection in the lobby.
    pub fn broadcast_room_list(&self) {
        let event = ServerEvent::RoomList {
            rooms: self.list_rooms(),
        };
        self.registry.broadcast_to_lobby(&event);
    }

    // ── Chat ────────────────────────────────────────────────────────

    fn handle_chat(&self, conn: &Connection, req: ChatMessageRequest) -> Result<(), EngineError> {
        let room_id = self
            .registry
            .room_of(conn.id)
            .ok_or(EngineError::UserNotInRoom)?;
        if !self.chat_limiter.check(&conn.user_id) {
            return Err(EngineError::RateLimited);
        }

        let content = req.content.trim();
        validation::validate_message(content, self.settings.max_message_length)?;
        let user = self.users.get(&conn.user_id)?;

        let message = ChatMessage::user(&room_id, &user.id, &user.name, content);
        self.chat.append(message.clone());
        self.registry
            .broadcast_to_room(&room_id, &ServerEvent::ChatMessage { message }, None);
        Ok(())
    }

    fn handle_reaction(
        &self,
        conn: &Connection,
        req: ReactionRequest,
        add: bool,
    ) -> Result<(), EngineError> {
        let room_id = self
            .registry
            .room_of(conn.id)
            .ok_or(EngineError::UserNotInRoom)?;
        validation::validate_emoji(&req.emoji)?;

        let user_ids = if add {
            self.chat
                .add_reaction(&room_id, &req.message_id, &req.emoji, &conn.user_id)?
        } else {
            self.chat
                .remove_reaction(&room_id, &req.message_id, &req.emoji, &conn.user_id)?
        };

        self.registry.broadcast_to_room(
            &room_id,
            &ServerEvent::ChatReaction {
                message_id: req.message_id,
                emoji: req.emoji,
                user_id: conn.user_id.clone(),
                user_ids,
            },
            None,
        );
        Ok(())
    }

    // ── Self-service ────────────────────────────────────────────────

    fn handle_admin_auth(&self, conn: &Connection, password: &str) {
        match self.admin_auth.authenticate(&conn.ip, password) {
            Ok(()) => {
                conn.set_admin(true);
                info!(conn_id = %conn.id, ip = %conn.ip, "connection elevated to admin");
                conn.send(ServerEvent::AdminAuthResult {
                    success: true,
                    message: "Admin access granted".into(),
                });
            }
            Err(err) => {
                warn!(conn_id = %conn.id, ip = %conn.ip, error = %err, "admin auth rejected");
                conn.send(ServerEvent::AdminAuthResult {
                    success: false,
                    message: err.to_string(),
                });
            }
        }
    }

    fn handle_mute_self(&self, conn: &Connection, muted: bool) -> Result<(), EngineError> {
        let user = self.users.get(&conn.user_id)?;
        user.set_muted(muted);
        self.announce_mute(&user);
        Ok(())
    }

    /// Stealth members only hear about their own mute state.
    fn announce_mute(&self, user: &User) {
        let event = ServerEvent::UserMuted {
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            is_muted: user.is_muted(),
        };
        match (user.is_stealth, user.room_id()) {
            (false, Some(room_id)) => {
                self.registry.broadcast_to_room(&room_id, &event, None);
            }
            _ => {
                if let Some(conn) = self.registry.find_by_user(&user.id) {
                    conn.send(event);
                }
            }
        }
    }

    // ── Admin actions ───────────────────────────────────────────────

    pub fn admin_create_room(&self, request: CreateRoom) -> Result<RoomInfo, EngineError> {
        let room = self.room_service.create_room(request)?;
        self.broadcast_room_list();
        Ok(room.info_for(true))
    }

    pub fn admin_mute(&self, user_id: &str, muted: bool) -> Result<Arc<User>, EngineError> {
        let user = self.moderator.mute(ADMIN_ACTOR, user_id, muted)?;
        self.announce_mute(&user);
        Ok(user)
    }

    pub fn admin_kick(&self, user_id: &str, reason: &str) -> Result<(), EngineError> {
        let outcome = self.moderator.kick(ADMIN_ACTOR, user_id, None, reason)?;
        self.evict_connection(&outcome.user, &outcome.room.id, ServerEvent::Kicked {
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn admin_ban(
        &self,
        user_id: &str,
        reason: &str,
        duration_minutes: i64,
    ) -> Result<Ban, EngineError> {
        let outcome = self
            .moderator
            .ban(ADMIN_ACTOR, user_id, reason, duration_minutes)?;
        let notice = ServerEvent::Banned {
            reason: reason.to_string(),
            duration_minutes,
        };
        match &outcome.room {
            Some(room) => self.evict_connection(&outcome.user, &room.id, notice),
            None => {
                if let Some(conn) = self.registry.find_by_user(&outcome.user.id) {
                    conn.send(notice);
                }
            }
        }
        Ok(outcome.ban)
    }

    /// Detach a removed user's connection from its room and tell everyone.
    fn evict_connection(&self, user: &User, room_id: &str, notice: ServerEvent) {
        if let Some(conn) = self.registry.find_by_user(&user.id) {
            self.registry.leave_room(conn.id);
            conn.reset_presence();
            conn.send(notice);
            conn.send(ServerEvent::RoomLeft);
        }
        if !user.is_stealth {
            self.registry.broadcast_to_room(
                room_id,
                &ServerEvent::UserLeft {
                    room_id: room_id.to_string(),
                    user_id: user.id.clone(),
                    user_name: user.name.clone(),
                },
                None,
            );
        }
        self.broadcast_room_list();
    }

    pub fn admin_close_room(&self, room_id: &str) -> Result<RoomInfo, EngineError> {
        let outcome = self.moderator.close_room(ADMIN_ACTOR, room_id)?;
        let room = &outcome.room;

        for conn in self.registry.evict_room(&room.id) {
            conn.reset_presence();
            conn.send(ServerEvent::RoomClosed {
                room_id: room.id.clone(),
                room_name: room.name.clone(),
            });
            conn.send(ServerEvent::RoomLeft);
        }
        self.chat.delete_room_messages(&room.id);
        self.broadcast_room_list();
        Ok(room.info_for(true))
    }

    pub fn list_bans(&self) -> Vec<Ban> {
        self.moderator.list_bans()
    }

    pub fn delete_ban(&self, ban_id: &str) -> Result<Ban, EngineError> {
        self.moderator.delete_ban(ADMIN_ACTOR, ban_id)
    }

    pub fn stats(&self) -> Stats {
        self.moderator.stats()
    }

    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityEntry> {
        self.activity.recent(limit)
    }

    pub fn users(&self) -> Vec<Arc<User>> {
        self.users.all()
    }

    // ── Media server ────────────────────────────────────────────────

    pub fn apply_media_event(&self, event: &MediaEvent) {
        if self.sessions.apply(event) {
            debug!(event = %event.event, "media event recorded");
        } else {
            debug!(event = %event.event, "media event ignored");
        }
    }

    pub fn media_sessions(&self) -> (Vec<RoomSession>, Vec<RoomSession>) {
        (self.sessions.active(), self.sessions.finished(50))
    }

    // ── Reapers ─────────────────────────────────────────────────────

    /// Delete empty, user-created rooms idle for longer than `idle`, chat
    /// log first. A room is retired before anything is dropped, so a join
    /// racing the sweep either keeps the room alive or lands in a fresh one.
    /// Returns how many rooms went.
    pub fn reap_idle_rooms(&self, idle: chrono::Duration) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for room in self.rooms.idle_empty_rooms(idle, now) {
            if self.registry.occupancy(&room.id) > 0 || !room.retire_if_idle(idle, now) {
                continue;
            }
            self.chat.delete_room_messages(&room.id);
            match self.rooms.delete(&room.id) {
                Ok(_) => {
                    removed += 1;
                    info!(room_id = %room.id, room = %room.name, "removed idle room");
                }
                Err(err) => {
                    warn!(room_id = %room.id, error = %err, "chat log dropped but room delete failed");
                }
            }
        }
        if removed > 0 {
            self.broadcast_room_list();
        }
        removed
    }

    pub fn reap_expired_bans(&self) -> usize {
        let removed = self.bans.delete_expired(Utc::now());
        if removed > 0 {
            info!(removed, "expired bans removed");
        }
        removed
    }

    /// Apply chat and activity retention. Returns (chat, activity) removed.
    pub fn reap_stale_logs(&self) -> (usize, usize) {
        let now = Utc::now();
        let chat = self.chat.prune_older_than(now - self.settings.chat_retention);
        let activity = self.activity.cleanup(self.settings.activity_retention, now);
        let buckets = self.chat_limiter.cleanup(LIMITER_IDLE);
        if chat + activity + buckets > 0 {
            info!(chat, activity, buckets, "stale log entries removed");
        }
        (chat, activity)
    }
}
