use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::activity::{ActivityEntry, ActivityKind, ActivityLedger};
use super::ban::{Ban, BanLedger};
use super::error::EngineError;
use super::room::{Room, RoomType};
use super::room_store::RoomStore;
use super::user::{User, UserStore};
use super::validation;

/// Recent activity entries included in stats.
const STATS_RECENT_ACTIVITY: usize = 20;

#[derive(Debug)]
pub struct KickOutcome {
    pub user: Arc<User>,
    pub room: Arc<Room>,
}

#[derive(Debug)]
pub struct BanOutcome {
    pub ban: Ban,
    pub user: Arc<User>,
    /// Room the target was removed from, if they were in one.
    pub room: Option<Arc<Room>>,
}

#[derive(Debug)]
pub struct CloseOutcome {
    pub room: Arc<Room>,
    pub evicted: Vec<Arc<User>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub participant_count: usize,
    pub capacity: usize,
    pub is_closed: bool,
    pub admin_created: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub active_rooms: usize,
    pub total_users: usize,
    pub peak_users_today: usize,
    pub joins_today: usize,
    pub active_bans: usize,
    pub rooms: Vec<RoomStats>,
    pub recent_activity: Vec<ActivityEntry>,
}

/// Admin actions over rooms, user records and bans.
pub struct Moderator {
    rooms: Arc<RoomStore>,
    users: Arc<UserStore>,
    bans: Arc<BanLedger>,
    activity: Arc<ActivityLedger>,
}

impl Moderator {
    pub fn new(
        rooms: Arc<RoomStore>,
        users: Arc<UserStore>,
        bans: Arc<BanLedger>,
        activity: Arc<ActivityLedger>,
    ) -> Self {
        Self {
            rooms,
            users,
            bans,
            activity,
        }
    }

    pub fn mute(&self, admin: &str, user_id: &str, muted: bool) -> Result<Arc<User>, EngineError> {
        let user = self.users.get(user_id)?;
        user.set_muted(muted);

        let mut entry = ActivityEntry::new(ActivityKind::AdminMute)
            .user(&user.id, &user.name)
            .detail("admin", admin)
            .detail("muted", muted);
        if let Some(room) = user.room_id().and_then(|id| self.rooms.get_by_id(&id).ok()) {
            entry = entry.room(&room.id, &room.name);
        }
        self.activity.record(entry);

        info!(%admin, user_id = %user.id, user = %user.name, muted, "admin mute");
        Ok(user)
    }

    /// Remove from the room, then delete the record. With no `room_id` the
    /// user's current room is used.
    pub fn kick(
        &self,
        admin: &str,
        user_id: &str,
        room_id: Option<&str>,
        reason: &str,
    ) -> Result<KickOutcome, EngineError> {
        validation::validate_reason(reason)?;
        let user = self.users.get(user_id)?;
        let room_id = match room_id {
            Some(id) => id.to_string(),
            None => user.room_id().ok_or(EngineError::UserNotInRoom)?,
        };
        let room = self.rooms.get_by_id(&room_id)?;

        room.remove_participant(user_id)?;
        if let Err(err) = self.users.delete(user_id) {
            warn!(%user_id, error = %err, "kick removed membership but record deletion failed");
            return Err(EngineError::PartialFailure {
                completed: "room removal",
                step: "user record deletion",
                source: Box::new(err),
            });
        }

        self.activity.record(
            ActivityEntry::new(ActivityKind::AdminKick)
                .user(&user.id, &user.name)
                .room(&room.id, &room.name)
                .ip(&user.ip)
                .detail("admin", admin)
                .detail("reason", reason),
        );
        info!(%admin, user_id = %user.id, user = %user.name, room = %room.name, %reason, "admin kick");
        Ok(KickOutcome { user, room })
    }

    /// Ban the user's IP, pull them out of their room, delete their record.
    pub fn ban(
        &self,
        admin: &str,
        user_id: &str,
        reason: &str,
        duration_minutes: i64,
    ) -> Result<BanOutcome, EngineError> {
        validation::validate_reason(reason)?;
        validation::validate_ban_duration(duration_minutes)?;
        let user = self.users.get(user_id)?;

        let ban = Ban::new(&user.ip, &user.name, reason, admin, duration_minutes)?;
        self.bans.create(ban.clone());

        let room = user
            .room_id()
            .and_then(|id| self.rooms.get_by_id(&id).ok());
        if let Some(room) = &room
            && let Err(err) = room.remove_participant(user_id)
        {
            warn!(%user_id, room = %room.name, error = %err, "banned user already gone from room");
        }

        if let Err(err) = self.users.delete(user_id) {
            return Err(EngineError::PartialFailure {
                completed: "ban",
                step: "user record deletion",
                source: Box::new(err),
            });
        }

        let mut entry = ActivityEntry::new(ActivityKind::AdminBan)
            .user(&user.id, &user.name)
            .ip(&user.ip)
            .detail("admin", admin)
            .detail("reason", reason)
            .detail("duration_minutes", duration_minutes);
        if let Some(room) = &room {
            entry = entry.room(&room.id, &room.name);
        }
        self.activity.record(entry);

        info!(%admin, user = %user.name, ip = %user.ip, duration_minutes, %reason, "admin ban");
        Ok(BanOutcome { ban, user, room })
    }

    /// Evict everyone, deleting each member's record, then mark the room
    /// closed. A join that lands while members are being removed is swept by
    /// a second pass once the flag is up.
    pub fn close_room(&self, admin: &str, room_id: &str) -> Result<CloseOutcome, EngineError> {
        let room = self.rooms.get_by_id(room_id)?;

        let mut evicted = self.evict_members(&room);
        room.close();
        evicted.extend(self.evict_members(&room));

        self.activity.record(
            ActivityEntry::new(ActivityKind::RoomClose)
                .room(&room.id, &room.name)
                .detail("admin", admin)
                .detail("evicted", evicted.len()),
        );
        info!(%admin, room = %room.name, evicted = evicted.len(), "room closed");
        Ok(CloseOutcome { room, evicted })
    }

    fn evict_members(&self, room: &Room) -> Vec<Arc<User>> {
        let mut evicted = Vec::new();
        for member in room.participants() {
            if let Err(err) = room.remove_participant(&member.id) {
                warn!(user_id = %member.id, error = %err, "member left during close");
                continue;
            }
            if let Err(err) = self.users.delete(&member.id) {
                warn!(user_id = %member.id, error = %err, "record already gone during close");
            }
            evicted.push(member);
        }
        evicted
    }

    pub fn list_bans(&self) -> Vec<Ban> {
        self.bans.active(Utc::now())
    }

    pub fn delete_ban(&self, admin: &str, ban_id: &str) -> Result<Ban, EngineError> {
        let ban = self.bans.delete(ban_id)?;
        info!(%admin, ip = %ban.ip, "ban lifted");
        Ok(ban)
    }

    pub fn stats(&self) -> Stats {
        let rooms: Vec<RoomStats> = self
            .rooms
            .all()
            .iter()
            .map(|r| RoomStats {
                id: r.id.clone(),
                name: r.name.clone(),
                room_type: r.room_type,
                participant_count: r.participant_count(),
                capacity: r.capacity,
                is_closed: r.is_closed(),
                admin_created: r.created_by.is_admin(),
                created_at: r.created_at,
                last_activity: r.last_activity(),
            })
            .collect();

        Stats {
            active_rooms: rooms
                .iter()
                .filter(|r| !r.is_closed && r.participant_count > 0)
                .count(),
            total_users: self.users.count(),
            peak_users_today: self.activity.peak_users_today(),
            joins_today: self.activity.joins_today(),
            active_bans: self.bans.active(Utc::now()).len(),
            rooms,
            recent_activity: self.activity.recent(STATS_RECENT_ACTIVITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::room::RoomOwner;
    use crate::engine::room_service::{CreateRoom, JoinRequest, RoomService};
    use crate::engine::user::VoiceMode;

    struct Fixture {
        service: RoomService,
        moderator: Moderator,
        users: Arc<UserStore>,
        bans: Arc<BanLedger>,
        lobby: Arc<Room>,
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
        let moderator = Moderator::new(rooms, users.clone(), bans.clone(), activity);
        let lobby = service
            .create_room(CreateRoom {
                name: "Lobby".into(),
                room_type: RoomType::Public,
                capacity: Some(100),
                created_by: RoomOwner::Admin,
            })
            .unwrap();
        Fixture {
            service,
            moderator,
            users,
            bans,
            lobby,
        }
    }

    fn join(f: &Fixture, user_id: &str, name: &str, ip: &str) -> Arc<User> {
        f.service
            .join(JoinRequest {
                room_name: "Lobby",
                user_id,
                user_name: name,
                voice_mode: VoiceMode::Vad,
                ip,
                is_admin: false,
                stealth: false,
            })
            .unwrap()
            .user
    }

    #[test]
    fn test_mute_sets_flag() {
        let f = fixture();
        let alice = join(&f, "u1", "alice", "10.0.0.1");
        f.moderator.mute("admin", "u1", true).unwrap();
        assert!(alice.is_muted());
        f.moderator.mute("admin", "u1", false).unwrap();
        assert!(!alice.is_muted());
        assert_eq!(
            f.moderator.mute("admin", "ghost", true).unwrap_err(),
            EngineError::UserNotFound
        );
    }

    #[test]
    fn test_kick_removes_membership_and_record() {
        let f = fixture();
        join(&f, "u1", "alice", "10.0.0.1");
        let out = f.moderator.kick("admin", "u1", None, "be nice").unwrap();
        assert_eq!(out.room.id, f.lobby.id);
        assert!(f.lobby.is_empty());
        assert!(!f.users.contains("u1"));
        // Kicked users can come back.
        join(&f, "u1", "alice", "10.0.0.1");
    }

    #[test]
    fn test_kick_wrong_room_mutates_nothing() {
        let f = fixture();
        join(&f, "u1", "alice", "10.0.0.1");
        let other = f
            .service
            .create_room(CreateRoom {
                name: "other".into(),
                room_type: RoomType::Public,
                capacity: None,
                created_by: RoomOwner::Admin,
            })
            .unwrap();
        let err = f
            .moderator
            .kick("admin", "u1", Some(other.id.as_str()), "")
            .unwrap_err();
        assert_eq!(err, EngineError::UserNotInRoom);
        assert!(f.users.contains("u1"));
        assert!(f.lobby.has_participant("u1"));
    }

    #[test]
    fn test_ban_evicts_and_blocks_rejoin() {
        let f = fixture();
        join(&f, "u1", "troll", "6.6.6.6");
        let out = f.moderator.ban("admin", "u1", "spam", 30).unwrap();

        assert_eq!(out.ban.ip, "6.6.6.6");
        assert_eq!(out.ban.duration_minutes(), 30);
        assert_eq!(out.room.map(|r| r.id.clone()), Some(f.lobby.id.clone()));
        assert!(f.lobby.is_empty());
        assert!(!f.users.contains("u1"));
        assert!(f.bans.is_banned("6.6.6.6"));

        let rejoin = f.service.join(JoinRequest {
            room_name: "Lobby",
            user_id: "u9",
            user_name: "new-me",
            voice_mode: VoiceMode::Ptt,
            ip: "6.6.6.6",
            is_admin: false,
            stealth: false,
        });
        assert_eq!(rejoin.unwrap_err(), EngineError::UserBanned);
    }

    #[test]
    fn test_ban_rejects_non_positive_duration() {
        let f = fixture();
        join(&f, "u1", "troll", "6.6.6.6");
        assert!(matches!(
            f.moderator.ban("admin", "u1", "spam", 0),
            Err(EngineError::Validation(_))
        ));
        assert!(f.users.contains("u1"));
    }

    #[test]
    fn test_ban_rejects_oversized_duration() {
        let f = fixture();
        join(&f, "u1", "troll", "6.6.6.6");
        assert!(matches!(
            f.moderator.ban("admin", "u1", "spam", 1_000_000_000_000),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            f.moderator
                .ban("admin", "u1", "spam", validation::MAX_BAN_MINUTES + 1),
            Err(EngineError::Validation(_))
        ));
        assert!(f.users.contains("u1"));
        assert!(f.bans.is_empty());

        let out = f
            .moderator
            .ban("admin", "u1", "spam", validation::MAX_BAN_MINUTES)
            .unwrap();
        assert_eq!(out.ban.duration_minutes(), validation::MAX_BAN_MINUTES);
    }

    #[test]
    fn test_close_room_evicts_everyone() {
        let f = fixture();
        join(&f, "u1", "alice", "10.0.0.1");
        join(&f, "u2", "bob", "10.0.0.2");

        let out = f.moderator.close_room("admin", &f.lobby.id).unwrap();
        assert_eq!(out.evicted.len(), 2);
        assert!(f.lobby.is_closed());
        assert!(f.lobby.is_empty());
        assert_eq!(f.users.count(), 0);
        assert!(out.evicted.iter().all(|u| u.room_id().is_none()));
    }

    #[test]
    fn test_close_room_removes_records_before_closing() {
        let f = fixture();
        join(&f, "u1", "alice", "10.0.0.1");
        join(&f, "u2", "bob", "10.0.0.2");

        let first = f.moderator.evict_members(&f.lobby);
        assert_eq!(first.len(), 2);
        assert!(!f.lobby.is_closed());
        assert_eq!(f.users.count(), 0);

        let out = f.moderator.close_room("admin", &f.lobby.id).unwrap();
        assert!(out.evicted.is_empty());
        assert!(f.lobby.is_closed());
    }

    #[test]
    fn test_close_room_tolerates_missing_records() {
        let f = fixture();
        join(&f, "u1", "alice", "10.0.0.1");
        f.users.delete("u1").unwrap();

        let out = f.moderator.close_room("admin", &f.lobby.id).unwrap();
        assert_eq!(out.evicted.len(), 1);
        assert!(f.lobby.is_empty());
        assert!(f.lobby.is_closed());
    }

    #[test]
    fn test_ban_listing_and_lifting() {
        let f = fixture();
        join(&f, "u1", "troll", "6.6.6.6");
        let ban = f.moderator.ban("admin", "u1", "spam", 30).unwrap().ban;
        assert_eq!(f.moderator.list_bans().len(), 1);

        f.moderator.delete_ban("admin", &ban.id).unwrap();
        assert!(f.moderator.list_bans().is_empty());
        assert!(!f.bans.is_banned("6.6.6.6"));
    }

    #[test]
    fn test_stats_snapshot() {
        let f = fixture();
        join(&f, "u1", "alice", "10.0.0.1");
        join(&f, "u2", "bob", "10.0.0.2");
        f.moderator.ban("admin", "u2", "spam", 10).unwrap();

        let stats = f.moderator.stats();
        assert_eq!(stats.active_rooms, 1);
        assert_eq!(stats.total_users, 1);
        assert_eq!(stats.peak_users_today, 2);
        assert_eq!(stats.joins_today, 2);
        assert_eq!(stats.active_bans, 1);
        assert_eq!(stats.rooms.len(), 1);
        assert!(stats.recent_activity.len() <= STATS_RECENT_ACTIVITY);
        assert_eq!(stats.recent_activity[0].kind, ActivityKind::AdminBan);
    }
}
