use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::events::ParticipantInfo;
use super::locks;

/// How the participant transmits audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMode {
    /// Push-to-talk.
    #[default]
    Ptt,
    /// Voice activity detection.
    Vad,
}

/// A participant record. Lives from join until leave/kick/ban/close.
///
/// Shared as `Arc<User>` between the owning room and the [`UserStore`]; the
/// two mutable fields use interior synchronization.
#[derive(Debug)]
pub struct User {
    pub id: String,
    pub name: String,
    pub voice_mode: VoiceMode,
    pub is_admin: bool,
    /// Invisible to non-admin viewers. Only admins may be stealth.
    pub is_stealth: bool,
    pub ip: String,
    pub joined_at: DateTime<Utc>,
    room_id: Mutex<Option<String>>,
    muted: AtomicBool,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            voice_mode: VoiceMode::default(),
            is_admin: false,
            is_stealth: false,
            ip: ip.into(),
            joined_at: Utc::now(),
            room_id: Mutex::new(None),
            muted: AtomicBool::new(false),
        }
    }

    pub fn with_voice_mode(mut self, mode: VoiceMode) -> Self {
        self.voice_mode = mode;
        self
    }

    /// Mark as admin. Stealth is only honored for admins.
    pub fn with_admin(mut self, is_admin: bool, stealth: bool) -> Self {
        self.is_admin = is_admin;
        self.is_stealth = is_admin && stealth;
        self
    }

    pub fn room_id(&self) -> Option<String> {
        locks::lock(&self.room_id).clone()
    }

    /// Only called by `Room` while it holds its own lock.
    pub(crate) fn set_room_id(&self, room_id: Option<String>) {
        *locks::lock(&self.room_id) = room_id;
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Whether `viewer` may see this user in participant listings.
    pub fn visible_to(&self, viewer: &User) -> bool {
        !self.is_stealth || viewer.is_admin
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            voice_mode: self.voice_mode,
            is_muted: self.is_muted(),
            is_admin: self.is_admin,
            joined_at: self.joined_at,
        }
    }
}

/// All live participant records, keyed by user ID.
#[derive(Default)]
pub struct UserStore {
    users: DashMap<String, Arc<User>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. Fails if the ID is already taken.
    pub fn create(&self, user: Arc<User>) -> Result<(), EngineError> {
        match self.users.entry(user.id.clone()) {
            Entry::Occupied(_) => Err(EngineError::UserAlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(user);
                Ok(())
            }
        }
    }

    pub fn get(&self, user_id: &str) -> Result<Arc<User>, EngineError> {
        self.users
            .get(user_id)
            .map(|u| u.clone())
            .ok_or(EngineError::UserNotFound)
    }

    pub fn delete(&self, user_id: &str) -> Result<Arc<User>, EngineError> {
        self.users
            .remove(user_id)
            .map(|(_, u)| u)
            .ok_or(EngineError::UserNotFound)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn in_room(&self, room_id: &str) -> Vec<Arc<User>> {
        self.users
            .iter()
            .filter(|u| u.room_id().as_deref() == Some(room_id))
            .map(|u| u.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<User>> {
        self.users.iter().map(|u| u.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }
}
