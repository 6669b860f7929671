use std::sync::Arc;

use tracing::{debug, info, warn};

use super::activity::{ActivityEntry, ActivityKind, ActivityLedger};
use super::ban::BanLedger;
use super::error::EngineError;
use super::events::{RoomInfo, RoomSummary};
use super::names::NameGenerator;
use super::room::{DEFAULT_ROOM_CAPACITY, Room, RoomOwner, RoomType};
use super::room_store::RoomStore;
use super::user::{User, UserStore, VoiceMode};
use super::validation;

/// Lookups allowed when the idle reaper retires a room mid-join.
const MAX_ADMIT_ATTEMPTS: usize = 3;

/// Input for [`RoomService::join`].
#[derive(Debug, Clone)]
pub struct JoinRequest<'a> {
    pub room_name: &'a str,
    pub user_id: &'a str,
    pub user_name: &'a str,
    pub voice_mode: VoiceMode,
    pub ip: &'a str,
    pub is_admin: bool,
    pub stealth: bool,
}

#[derive(Debug)]
pub struct JoinOutcome {
    pub room: Arc<Room>,
    pub user: Arc<User>,
    /// Other members the new user may see.
    pub participants: Vec<Arc<User>>,
    pub is_new_room: bool,
}

#[derive(Debug)]
pub struct LeaveOutcome {
    /// `None` when the room was already removed.
    pub room: Option<Arc<Room>>,
    pub user: Arc<User>,
    pub is_empty: bool,
}

#[derive(Debug, Clone)]
pub struct CreateRoom {
    pub name: String,
    pub room_type: RoomType,
    /// `None` or zero uses the configured default.
    pub capacity: Option<usize>,
    pub created_by: RoomOwner,
}

/// How `get_room` identifies its target.
#[derive(Debug, Clone, Copy)]
pub enum RoomLookup<'a> {
    Id(&'a str),
    Name(&'a str),
}

/// Join/leave orchestration over rooms, user records and bans.
pub struct RoomService {
    rooms: Arc<RoomStore>,
    users: Arc<UserStore>,
    bans: Arc<BanLedger>,
    activity: Arc<ActivityLedger>,
    names: NameGenerator,
    default_capacity: usize,
}

impl RoomService {
    pub fn new(
        rooms: Arc<RoomStore>,
        users: Arc<UserStore>,
        bans: Arc<BanLedger>,
        activity: Arc<ActivityLedger>,
        default_capacity: usize,
    ) -> Self {
        Self {
            rooms,
            users,
            bans,
            activity,
            names: NameGenerator::new(),
            default_capacity: if default_capacity == 0 {
                DEFAULT_ROOM_CAPACITY
            } else {
                default_capacity
            },
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    // ── Rooms ───────────────────────────────────────────────────────

    pub fn create_room(&self, request: CreateRoom) -> Result<Arc<Room>, EngineError> {
        validation::validate_room_name(&request.name).map_err(EngineError::InvalidRoomName)?;

        let capacity = request
            .capacity
            .filter(|c| *c > 0)
            .unwrap_or(self.default_capacity);
        let room = self.rooms.create(Room::new(
            request.name,
            request.room_type,
            capacity,
            request.created_by,
        ))?;

        self.activity.record(
            ActivityEntry::new(ActivityKind::RoomCreate)
                .room(&room.id, &room.name)
                .detail("capacity", room.capacity)
                .detail("admin_created", room.created_by.is_admin()),
        );
        info!(room_id = %room.id, room = %room.name, capacity = room.capacity, "room created");
        Ok(room)
    }

    /// Public, open rooms with stealth members left out of the counts.
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        self.rooms.public_rooms().iter().map(|r| r.summary()).collect()
    }

    /// Every room with raw counts, for admins.
    pub fn list_all_rooms(&self) -> Vec<RoomSummary> {
        self.rooms.all().iter().map(|r| r.admin_summary()).collect()
    }

    /// Preview a room. An unknown name yields a joinable placeholder, since
    /// joining would create it; an unknown ID is an error.
    pub fn get_room(
        &self,
        lookup: RoomLookup<'_>,
        viewer_is_admin: bool,
    ) -> Result<RoomInfo, EngineError> {
        match lookup {
            RoomLookup::Id(id) => Ok(self.rooms.get_by_id(id)?.info_for(viewer_is_admin)),
            RoomLookup::Name(name) => match self.rooms.get_by_name(name) {
                Some(room) => Ok(room.info_for(viewer_is_admin)),
                None => Ok(RoomInfo {
                    id: String::new(),
                    name: name.to_string(),
                    room_type: RoomType::Public,
                    capacity: self.default_capacity,
                    participant_count: 0,
                    participants: Vec::new(),
                    can_join: true,
                    is_closed: false,
                }),
            },
        }
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Admit a user into a room by name, creating the room if needed.
    ///
    /// Order: ban check, room lookup/creation, closed/full checks and name
    /// resolution (under the room lock), user record insert. A failed record
    /// insert takes the membership back out.
    pub fn join(&self, request: JoinRequest<'_>) -> Result<JoinOutcome, EngineError> {
        if self.bans.is_banned(request.ip) {
            warn!(ip = %request.ip, user = %request.user_name, "banned address tried to join");
            return Err(EngineError::UserBanned);
        }

        validation::validate_room_name(request.room_name).map_err(EngineError::InvalidRoomName)?;
        validation::validate_user_name(request.user_name)?;

        let (room, user, is_new_room) = self.admit_by_name(&request)?;

        if let Err(err) = self.users.create(user.clone()) {
            if let Err(rollback) = room.remove_participant(&user.id) {
                warn!(user_id = %user.id, error = %rollback, "rollback after failed user insert");
            }
            return Err(err);
        }

        self.activity.record(
            ActivityEntry::new(ActivityKind::UserJoin)
                .user(&user.id, &user.name)
                .room(&room.id, &room.name)
                .ip(&user.ip)
                .detail("voice_mode", serde_json::json!(user.voice_mode))
                .detail("stealth", user.is_stealth),
        );
        self.activity.update_peak_users(self.users.count());

        let participants = room
            .visible_participants(&user)
            .into_iter()
            .filter(|p| p.id != user.id)
            .collect();

        info!(
            user_id = %user.id,
            user = %user.name,
            room_id = %room.id,
            room = %room.name,
            is_new_room,
            "joined room"
        );
        Ok(JoinOutcome {
            room,
            user,
            participants,
            is_new_room,
        })
    }

    /// Get or create the named room and admit the user. A room retired by the
    /// idle reaper between lookup and admission is looked up again; the store
    /// hands out a fresh one in its place.
    fn admit_by_name(
        &self,
        request: &JoinRequest<'_>,
    ) -> Result<(Arc<Room>, Arc<User>, bool), EngineError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let (room, is_new_room) = self.rooms.get_or_create(request.room_name, || {
                Room::new(
                    request.room_name,
                    RoomType::Public,
                    self.default_capacity,
                    RoomOwner::User(request.user_id.to_string()),
                )
            });
            if is_new_room {
                self.activity.record(
                    ActivityEntry::new(ActivityKind::RoomCreate)
                        .room(&room.id, &room.name)
                        .user(request.user_id, request.user_name)
                        .detail("capacity", room.capacity),
                );
                info!(room_id = %room.id, room = %room.name, "room created on join");
            }

            let admitted = room.admit(request.user_id, request.user_name, &self.names, |name| {
                User::new(request.user_id, name, request.ip)
                    .with_voice_mode(request.voice_mode)
                    .with_admin(request.is_admin, request.stealth)
            });
            match admitted {
                Ok(user) => return Ok((room, user, is_new_room)),
                Err(EngineError::RoomNotFound) if attempts < MAX_ADMIT_ATTEMPTS => {
                    debug!(room = %room.name, "room retired during join, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Take a user out of a room and drop their record. If the room itself is
    /// already gone but the user is still stamped with it, the record is
    /// dropped anyway.
    pub fn leave(&self, user_id: &str, room_id: &str) -> Result<LeaveOutcome, EngineError> {
        let user = self.users.get(user_id)?;
        let room = match self.rooms.get_by_id(room_id) {
            Ok(room) => {
                room.remove_participant(user_id)?;
                Some(room)
            }
            Err(EngineError::RoomNotFound) if user.room_id().as_deref() == Some(room_id) => {
                warn!(%user_id, %room_id, "room vanished before leave; dropping record");
                user.set_room_id(None);
                None
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = self.users.delete(user_id) {
            return Err(EngineError::PartialFailure {
                completed: "room removal",
                step: "user record deletion",
                source: Box::new(err),
            });
        }

        let mut entry = ActivityEntry::new(ActivityKind::UserLeave)
            .user(&user.id, &user.name)
            .ip(&user.ip);
        if let Some(room) = &room {
            entry = entry.room(&room.id, &room.name);
        }
        self.activity.record(entry);

        let is_empty = room.as_ref().is_none_or(|r| r.is_empty());
        info!(user_id = %user.id, user = %user.name, %room_id, is_empty, "left room");
        Ok(LeaveOutcome {
            room,
            user,
            is_empty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ban::Ban;
    use chrono::Utc;

    struct Fixture {
        service: RoomService,
        rooms: Arc<RoomStore>,
        users: Arc<UserStore>,
        bans: Arc<BanLedger>,
        activity: Arc<ActivityLedger>,
    }

    fn fixture() -> Fixture {
        let rooms = Arc::new(RoomStore::new());
        let users = Arc::new(UserStore::new());
        let bans = Arc::new(BanLedger::new());
        let activity = Arc::new(ActivityLedger::new());
        let service = RoomService::new(
            rooms.clone(),
            users.clone(),
            bans.clone(),
            activity.clone(),
            15,
        );
        Fixture {
            service,
            rooms,
            users,
            bans,
            activity,
        }
    }

    fn join<'a>(room: &'a str, user_id: &'a str, name: &'a str, ip: &'a str) -> JoinRequest<'a> {
        JoinRequest {
            room_name: room,
            user_id,
            user_name: name,
            voice_mode: VoiceMode::Ptt,
            ip,
            is_admin: false,
            stealth: false,
        }
    }

    fn lobby(f: &Fixture, capacity: usize) -> Arc<Room> {
        f.service
            .create_room(CreateRoom {
                name: "Lobby".into(),
                room_type: RoomType::Public,
                capacity: Some(capacity),
                created_by: RoomOwner::Admin,
            })
            .unwrap()
    }

    #[test]
    fn test_create_room_validation() {
        let f = fixture();
        lobby(&f, 100);
        let dup = f.service.create_room(CreateRoom {
            name: "Lobby".into(),
            room_type: RoomType::Public,
            capacity: None,
            created_by: RoomOwner::Admin,
        });
        assert_eq!(dup.unwrap_err(), EngineError::DuplicateRoomName("Lobby".into()));

        let empty = f.service.create_room(CreateRoom {
            name: "".into(),
            room_type: RoomType::Public,
            capacity: None,
            created_by: RoomOwner::Admin,
        });
        assert!(matches!(empty, Err(EngineError::InvalidRoomName(_))));
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let f = fixture();
        let room = f
            .service
            .create_room(CreateRoom {
                name: "jam".into(),
                room_type: RoomType::Public,
                capacity: Some(0),
                created_by: RoomOwner::Admin,
            })
            .unwrap();
        assert_eq!(room.capacity, 15);
    }

    #[test]
    fn test_join_creates_room_on_demand() {
        let f = fixture();
        let out = f.service.join(join("jam", "u1", "alice", "10.0.0.1")).unwrap();
        assert!(out.is_new_room);
        assert_eq!(out.room.created_by, RoomOwner::User("u1".into()));
        assert_eq!(out.room.room_type, RoomType::Public);
        assert!(out.participants.is_empty());
        assert_eq!(f.users.count(), 1);
        assert_eq!(out.user.room_id().as_deref(), Some(out.room.id.as_str()));

        let second = f.service.join(join("jam", "u2", "bob", "10.0.0.2")).unwrap();
        assert!(!second.is_new_room);
        assert_eq!(second.participants.len(), 1);
        assert_eq!(second.participants[0].id, "u1");
    }

    #[test]
    fn test_ban_checked_before_room_lookup() {
        let f = fixture();
        f.bans.create(Ban::new("6.6.6.6", "troll", "spam", "admin", 30).unwrap());
        let err = f
            .service
            .join(join("brand-new", "u1", "troll", "6.6.6.6"))
            .unwrap_err();
        assert_eq!(err, EngineError::UserBanned);
        // No room got created as a side effect.
        assert!(!f.rooms.exists("brand-new"));
    }

    #[test]
    fn test_closed_and_full_rooms_reject() {
        let f = fixture();
        let room = lobby(&f, 1);
        f.service.join(join("Lobby", "u1", "alice", "10.0.0.1")).unwrap();
        assert_eq!(
            f.service
                .join(join("Lobby", "u2", "bob", "10.0.0.2"))
                .unwrap_err(),
            EngineError::RoomFull
        );

        room.close();
        assert_eq!(
            f.service
                .join(join("Lobby", "u3", "carol", "10.0.0.3"))
                .unwrap_err(),
            EngineError::RoomClosed
        );
        assert_eq!(f.users.count(), 1);
    }

    #[test]
    fn test_duplicate_name_is_suffixed() {
        let f = fixture();
        lobby(&f, 10);
        f.service.join(join("Lobby", "u1", "alice", "10.0.0.1")).unwrap();
        let out = f.service.join(join("Lobby", "u2", "alice", "10.0.0.2")).unwrap();
        assert_ne!(out.user.name, "alice");
        assert!(out.user.name.starts_with("alice_"));
    }

    #[test]
    fn test_failed_record_insert_rolls_back_membership() {
        let f = fixture();
        let room = lobby(&f, 10);
        // A stale record with the same ID makes the insert fail.
        f.users
            .create(Arc::new(User::new("u1", "ghost", "10.0.0.9")))
            .unwrap();

        let err = f
            .service
            .join(join("Lobby", "u1", "alice", "10.0.0.1"))
            .unwrap_err();
        assert_eq!(err, EngineError::UserAlreadyExists);
        assert!(room.is_empty());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let f = fixture();
        assert!(matches!(
            f.service.join(join("", "u1", "alice", "ip")),
            Err(EngineError::InvalidRoomName(_))
        ));
        assert!(matches!(
            f.service.join(join("jam", "u1", " ", "ip")),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_stealth_admin_hidden_from_joiners() {
        let f = fixture();
        lobby(&f, 10);
        let mut ghost = join("Lobby", "admin", "root", "127.0.0.1");
        ghost.is_admin = true;
        ghost.stealth = true;
        f.service.join(ghost).unwrap();

        let out = f.service.join(join("Lobby", "u1", "alice", "10.0.0.1")).unwrap();
        assert!(out.participants.is_empty());
        assert_eq!(f.service.list_rooms()[0].participant_count, 1);
        assert_eq!(f.service.list_all_rooms()[0].participant_count, 2);
    }

    #[test]
    fn test_leave_deletes_record_and_reports_empty() {
        let f = fixture();
        let room = lobby(&f, 10);
        f.service.join(join("Lobby", "u1", "alice", "10.0.0.1")).unwrap();
        let out = f.service.leave("u1", &room.id).unwrap();
        assert!(out.is_empty);
        assert_eq!(f.users.count(), 0);
        assert_eq!(out.user.room_id(), None);

        assert_eq!(
            f.service.leave("u1", &room.id).unwrap_err(),
            EngineError::UserNotFound
        );
    }

    #[test]
    fn test_leave_unknown_room() {
        let f = fixture();
        lobby(&f, 10);
        f.service.join(join("Lobby", "u1", "alice", "10.0.0.1")).unwrap();
        assert_eq!(
            f.service.leave("u1", "nope").unwrap_err(),
            EngineError::RoomNotFound
        );
        // Nothing was touched.
        assert_eq!(f.users.count(), 1);
    }

    #[test]
    fn test_leave_after_room_removed_drops_record() {
        let f = fixture();
        let out = f.service.join(join("jam", "u1", "alice", "10.0.0.1")).unwrap();
        f.rooms.delete(&out.room.id).unwrap();

        let left = f.service.leave("u1", &out.room.id).unwrap();
        assert!(left.room.is_none());
        assert!(left.is_empty);
        assert_eq!(left.user.room_id(), None);
        assert_eq!(f.users.count(), 0);
    }

    #[test]
    fn test_join_skips_room_retired_mid_join() {
        let f = fixture();
        let first = f.service.join(join("jam", "u1", "alice", "10.0.0.1")).unwrap();
        f.service.leave("u1", &first.room.id).unwrap();

        let old = first.room;
        old.set_last_activity(Utc::now() - chrono::Duration::hours(1));
        assert!(old.retire_if_idle(chrono::Duration::minutes(10), Utc::now()));

        let again = f.service.join(join("jam", "u2", "bob", "10.0.0.2")).unwrap();
        assert!(again.is_new_room);
        assert_ne!(again.room.id, old.id);
        assert!(old.is_empty());
        assert_eq!(again.user.room_id().as_deref(), Some(again.room.id.as_str()));
    }

    #[test]
    fn test_get_room_placeholder_and_missing_id() {
        let f = fixture();
        let preview = f.service.get_room(RoomLookup::Name("future"), false).unwrap();
        assert!(preview.can_join);
        assert_eq!(preview.capacity, 15);
        assert!(preview.id.is_empty());

        assert_eq!(
            f.service.get_room(RoomLookup::Id("nope"), false).unwrap_err(),
            EngineError::RoomNotFound
        );
    }

    #[test]
    fn test_activity_is_recorded() {
        let f = fixture();
        let room = lobby(&f, 10);
        f.service.join(join("Lobby", "u1", "alice", "10.0.0.1")).unwrap();
        f.service.leave("u1", &room.id).unwrap();

        let kinds: Vec<ActivityKind> = f.activity.recent(10).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ActivityKind::UserLeave,
                ActivityKind::UserJoin,
                ActivityKind::RoomCreate
            ]
        );
        assert_eq!(f.activity.peak_users_today(), 1);
        assert_eq!(f.activity.joins_today(), 1);
    }
}
