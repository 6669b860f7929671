use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::events::{ParticipantInfo, RoomInfo, RoomSummary};
use super::locks;
use super::names::NameGenerator;
use super::user::User;

/// Capacity used when a room is created without one.
pub const DEFAULT_ROOM_CAPACITY: usize = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    #[default]
    Public,
    Private,
}

/// Who created a room. Admin rooms are never reaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "lowercase")]
pub enum RoomOwner {
    Admin,
    User(String),
}

impl RoomOwner {
    pub fn is_admin(&self) -> bool {
        matches!(self, RoomOwner::Admin)
    }
}

/// A voice room. Identity fields are immutable; membership, activity time
/// and the closed flag sit behind the room's own lock.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub room_type: RoomType,
    pub capacity: usize,
    pub created_by: RoomOwner,
    pub created_at: DateTime<Utc>,
    state: RwLock<RoomState>,
}

#[derive(Debug)]
struct RoomState {
    participants: HashMap<String, Arc<User>>,
    last_activity: DateTime<Utc>,
    is_closed: bool,
    /// Set by the idle reaper just before removal; the room never admits again.
    retired: bool,
}

impl RoomState {
    /// Shared admission checks, in priority order.
    fn check_admission(&self, capacity: usize, user_id: &str) -> Result<(), EngineError> {
        if self.retired {
            return Err(EngineError::RoomNotFound);
        }
        if self.is_closed {
            return Err(EngineError::RoomClosed);
        }
        if self.participants.contains_key(user_id) {
            return Err(EngineError::UserAlreadyInRoom);
        }
        if self.participants.len() >= capacity {
            return Err(EngineError::RoomFull);
        }
        Ok(())
    }
}

impl Room {
    pub fn new(
        name: impl Into<String>,
        room_type: RoomType,
        capacity: usize,
        created_by: RoomOwner,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            room_type,
            capacity: if capacity == 0 {
                DEFAULT_ROOM_CAPACITY
            } else {
                capacity
            },
            created_by,
            created_at: now,
            state: RwLock::new(RoomState {
                participants: HashMap::new(),
                last_activity: now,
                is_closed: false,
                retired: false,
            }),
        }
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Admit `user`. Fails with `RoomClosed`, `UserAlreadyInRoom` or `RoomFull`
    /// (checked in that order). Stamps the user's room on success.
    pub fn add_participant(&self, user: Arc<User>) -> Result<(), EngineError> {
        let mut state = locks::write(&self.state);
        state.check_admission(self.capacity, &user.id)?;
        self.insert_locked(&mut state, user);
        Ok(())
    }

    /// Like [`Room::add_participant`], but resolves a collision-free display
    /// name against current members under the same lock before building the
    /// user, so two concurrent joins cannot end up with the same name.
    pub fn admit(
        &self,
        user_id: &str,
        requested_name: &str,
        names: &NameGenerator,
        build: impl FnOnce(String) -> User,
    ) -> Result<Arc<User>, EngineError> {
        let mut state = locks::write(&self.state);
        state.check_admission(self.capacity, user_id)?;

        let taken: HashSet<String> = state
            .participants
            .values()
            .map(|p| p.name.clone())
            .collect();
        let user = Arc::new(build(names.unique_name(requested_name, &taken)));
        self.insert_locked(&mut state, user.clone());
        Ok(user)
    }

    fn insert_locked(&self, state: &mut RoomState, user: Arc<User>) {
        user.set_room_id(Some(self.id.clone()));
        state.participants.insert(user.id.clone(), user);
        state.last_activity = Utc::now();
    }

    /// Remove a member. Clears their room stamp.
    pub fn remove_participant(&self, user_id: &str) -> Result<Arc<User>, EngineError> {
        let mut state = locks::write(&self.state);
        let user = state
            .participants
            .remove(user_id)
            .ok_or(EngineError::UserNotInRoom)?;
        user.set_room_id(None);
        state.last_activity = Utc::now();
        Ok(user)
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        locks::read(&self.state).participants.contains_key(user_id)
    }

    pub fn participant(&self, user_id: &str) -> Option<Arc<User>> {
        locks::read(&self.state).participants.get(user_id).cloned()
    }

    /// Every member including stealth ones, oldest first.
    pub fn participants(&self) -> Vec<Arc<User>> {
        let mut members: Vec<Arc<User>> =
            locks::read(&self.state).participants.values().cloned().collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.name.cmp(&b.name)));
        members
    }

    /// Members `viewer` may see: stealth members are hidden from non-admins.
    pub fn visible_participants(&self, viewer: &User) -> Vec<Arc<User>> {
        self.participants_visible_to(viewer.is_admin)
    }

    /// Same filter for callers with no participant record (lobby, admin API).
    pub fn participants_visible_to(&self, viewer_is_admin: bool) -> Vec<Arc<User>> {
        self.participants()
            .into_iter()
            .filter(|p| viewer_is_admin || !p.is_stealth)
            .collect()
    }

    pub fn participant_names(&self) -> HashSet<String> {
        locks::read(&self.state)
            .participants
            .values()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn participant_count(&self) -> usize {
        locks::read(&self.state).participants.len()
    }

    /// Count shown to non-admins (stealth members excluded).
    pub fn visible_participant_count(&self) -> usize {
        locks::read(&self.state)
            .participants
            .values()
            .filter(|p| !p.is_stealth)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        locks::read(&self.state).participants.is_empty()
    }

    pub fn is_full(&self) -> bool {
        locks::read(&self.state).participants.len() >= self.capacity
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Mark closed. Idempotent; does not evict anyone.
    pub fn close(&self) {
        locks::write(&self.state).is_closed = true;
    }

    pub fn is_closed(&self) -> bool {
        locks::read(&self.state).is_closed
    }

    /// Retire the room if it is still empty and idle longer than `idle`.
    /// The check and the flag share one write lock, so a racing admission
    /// either lands first (and the room stays) or fails with `RoomNotFound`.
    pub fn retire_if_idle(&self, idle: Duration, now: DateTime<Utc>) -> bool {
        let mut state = locks::write(&self.state);
        if state.retired {
            return true;
        }
        if !state.participants.is_empty() || now - state.last_activity <= idle {
            return false;
        }
        state.retired = true;
        true
    }

    pub fn is_retired(&self) -> bool {
        locks::read(&self.state).retired
    }

    pub fn can_join(&self) -> bool {
        let state = locks::read(&self.state);
        !state.is_closed && !state.retired && state.participants.len() < self.capacity
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        locks::read(&self.state).last_activity
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity()
    }

    // ── Views ───────────────────────────────────────────────────────

    pub fn summary(&self) -> RoomSummary {
        let state = locks::read(&self.state);
        let visible = state.participants.values().filter(|p| !p.is_stealth).count();
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            room_type: self.room_type,
            participant_count: visible,
            capacity: self.capacity,
            is_full: state.participants.len() >= self.capacity,
        }
    }

    /// Summary with stealth members counted, for admins.
    pub fn admin_summary(&self) -> RoomSummary {
        RoomSummary {
            participant_count: self.participant_count(),
            ..self.summary()
        }
    }

    pub fn info_for(&self, viewer_is_admin: bool) -> RoomInfo {
        let participants: Vec<ParticipantInfo> = self
            .participants_visible_to(viewer_is_admin)
            .iter()
            .map(|p| p.info())
            .collect();
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            room_type: self.room_type,
            capacity: self.capacity,
            participant_count: participants.len(),
            participants,
            can_join: self.can_join(),
            is_closed: self.is_closed(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        locks::write(&self.state).last_activity = at;
    }
}
