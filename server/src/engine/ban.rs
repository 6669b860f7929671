use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::error::EngineError;
use super::locks;

/// An IP ban. Expired bans are ignored by lookups and swept by the reaper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ban {
    pub id: String,
    pub ip: String,
    /// Display name of the banned user at the time of the ban.
    pub user_name: String,
    pub reason: String,
    pub banned_by: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Ban {
    /// Fails when the expiry cannot be represented.
    pub fn new(
        ip: impl Into<String>,
        user_name: impl Into<String>,
        reason: impl Into<String>,
        banned_by: impl Into<String>,
        duration_minutes: i64,
    ) -> Result<Self, EngineError> {
        let now = Utc::now();
        let expires_at = Duration::try_minutes(duration_minutes)
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| EngineError::Validation("Ban duration out of range".into()))?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            ip: ip.into(),
            user_name: user_name.into(),
            reason: reason.into(),
            banned_by: banned_by.into(),
            banned_at: now,
            expires_at,
        })
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.expires_at - self.banned_at).num_minutes()
    }
}

/// Bans by ID plus a pointer from IP to the latest ban for it.
#[derive(Default)]
pub struct BanLedger {
    state: RwLock<BanState>,
}

#[derive(Default)]
struct BanState {
    by_id: HashMap<String, Ban>,
    id_by_ip: HashMap<String, String>,
}

impl BanLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a ban. A newer ban for the same IP takes over the IP pointer; the
    /// older record stays in the ID table until swept or deleted.
    pub fn create(&self, ban: Ban) {
        let mut state = locks::write(&self.state);
        state.id_by_ip.insert(ban.ip.clone(), ban.id.clone());
        state.by_id.insert(ban.id.clone(), ban);
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.is_banned_at(ip, Utc::now())
    }

    pub fn is_banned_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        self.get_by_ip_at(ip, now).is_some()
    }

    pub fn get_by_ip(&self, ip: &str) -> Option<Ban> {
        self.get_by_ip_at(ip, Utc::now())
    }

    /// The live ban for `ip`, if any. Expiry is applied lazily here.
    pub fn get_by_ip_at(&self, ip: &str, now: DateTime<Utc>) -> Option<Ban> {
        let state = locks::read(&self.state);
        state
            .id_by_ip
            .get(ip)
            .and_then(|id| state.by_id.get(id))
            .filter(|ban| ban.is_active_at(now))
            .cloned()
    }

    pub fn get(&self, ban_id: &str) -> Result<Ban, EngineError> {
        locks::read(&self.state)
            .by_id
            .get(ban_id)
            .cloned()
            .ok_or(EngineError::BanNotFound)
    }

    pub fn delete(&self, ban_id: &str) -> Result<Ban, EngineError> {
        let mut state = locks::write(&self.state);
        let ban = state.by_id.remove(ban_id).ok_or(EngineError::BanNotFound)?;
        if state.id_by_ip.get(&ban.ip) == Some(&ban.id) {
            state.id_by_ip.remove(&ban.ip);
        }
        Ok(ban)
    }

    /// Physically remove every ban past its expiry. Returns how many went.
    pub fn delete_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = locks::write(&self.state);
        let expired: Vec<Ban> = state
            .by_id
            .values()
            .filter(|b| !b.is_active_at(now))
            .cloned()
            .collect();

        for ban in &expired {
            state.by_id.remove(&ban.id);
            if state.id_by_ip.get(&ban.ip) == Some(&ban.id) {
                state.id_by_ip.remove(&ban.ip);
            }
        }
        expired.len()
    }

    /// Unexpired bans, newest first.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<Ban> {
        let mut bans: Vec<Ban> = locks::read(&self.state)
            .by_id
            .values()
            .filter(|b| b.is_active_at(now))
            .cloned()
            .collect();
        bans.sort_by(|a, b| b.banned_at.cmp(&a.banned_at));
        bans
    }

    pub fn len(&self) -> usize {
        locks::read(&self.state).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
