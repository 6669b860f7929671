use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::locks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    UserJoin,
    UserLeave,
    RoomCreate,
    RoomClose,
    AdminMute,
    AdminKick,
    AdminBan,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(kind: ActivityKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            user_id: None,
            user_name: None,
            room_id: None,
            room_name: None,
            ip: None,
            details: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(mut self, id: &str, name: &str) -> Self {
        self.user_id = Some(id.to_string());
        self.user_name = Some(name.to_string());
        self
    }

    pub fn room(mut self, id: &str, name: &str) -> Self {
        self.room_id = Some(id.to_string());
        self.room_name = Some(name.to_string());
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Append-only analytics log with a daily peak-user gauge.
#[derive(Default)]
pub struct ActivityLedger {
    state: Mutex<ActivityState>,
}

#[derive(Default)]
struct ActivityState {
    entries: VecDeque<ActivityEntry>,
    peak_date: Option<NaiveDate>,
    peak_users: usize,
}

impl ActivityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: ActivityEntry) {
        locks::lock(&self.state).entries.push_back(entry);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        locks::lock(&self.state)
            .entries
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn joins_on(&self, day: NaiveDate) -> usize {
        locks::lock(&self.state)
            .entries
            .iter()
            .filter(|e| e.kind == ActivityKind::UserJoin && e.timestamp.date_naive() == day)
            .count()
    }

    pub fn joins_today(&self) -> usize {
        self.joins_on(Utc::now().date_naive())
    }

    /// Raise today's peak if `current` beats it. The gauge resets each day.
    pub fn update_peak_users(&self, current: usize) {
        self.update_peak_users_at(current, Utc::now())
    }

    pub fn update_peak_users_at(&self, current: usize, now: DateTime<Utc>) {
        let mut state = locks::lock(&self.state);
        let today = now.date_naive();
        if state.peak_date != Some(today) {
            state.peak_date = Some(today);
            state.peak_users = 0;
        }
        state.peak_users = state.peak_users.max(current);
    }

    pub fn peak_users_today(&self) -> usize {
        let state = locks::lock(&self.state);
        if state.peak_date == Some(Utc::now().date_naive()) {
            state.peak_users
        } else {
            0
        }
    }

    /// Drop entries older than `retention` as of `now`. Returns how many went.
    pub fn cleanup(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - retention;
        let mut state = locks::lock(&self.state);
        let before = state.entries.len();
        state.entries.retain(|e| e.timestamp >= cutoff);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        locks::lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
