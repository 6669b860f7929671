use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::locks;

/// Finished sessions kept for the admin view.
const MAX_FINISHED_SESSIONS: usize = 200;

/// One media-server room lifetime, as reported by webhooks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSession {
    pub sid: String,
    pub room_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_participants: usize,
    pub peak_participants: usize,
    pub total_joins: usize,
}

impl RoomSession {
    pub fn duration_secs(&self) -> Option<i64> {
        self.ended_at.map(|end| (end - self.started_at).num_seconds())
    }
}

/// Webhook body posted by the media server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEvent {
    pub event: String,
    #[serde(default)]
    pub room: Option<MediaRoom>,
    #[serde(default)]
    pub participant: Option<MediaParticipant>,
    /// Unix seconds.
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRoom {
    #[serde(default)]
    pub sid: String,
    pub name: String,
    #[serde(default)]
    pub num_participants: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaParticipant {
    #[serde(default)]
    pub sid: String,
    pub identity: String,
    #[serde(default)]
    pub name: String,
}

impl MediaEvent {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.created_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now)
    }
}

/// Tracks media-server room sessions keyed by room name.
#[derive(Default)]
pub struct RoomSessionLedger {
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    active: HashMap<String, RoomSession>,
    finished: Vec<RoomSession>,
}

impl SessionState {
    /// Participant events can arrive before `room_started`; open a session
    /// on demand so nothing is lost.
    fn active_mut(&mut self, room_name: &str, sid: &str, at: DateTime<Utc>) -> &mut RoomSession {
        self.active
            .entry(room_name.to_string())
            .or_insert_with(|| RoomSession {
                sid: sid.to_string(),
                room_name: room_name.to_string(),
                started_at: at,
                ended_at: None,
                current_participants: 0,
                peak_participants: 0,
                total_joins: 0,
            })
    }
}

impl RoomSessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_started(&self, room_name: &str, sid: &str, at: DateTime<Utc>) {
        let mut state = locks::lock(&self.state);
        state.active_mut(room_name, sid, at);
    }

    pub fn participant_joined(&self, room_name: &str, sid: &str, at: DateTime<Utc>) {
        let mut state = locks::lock(&self.state);
        let session = state.active_mut(room_name, sid, at);
        session.current_participants += 1;
        session.total_joins += 1;
        session.peak_participants = session.peak_participants.max(session.current_participants);
    }

    pub fn participant_left(&self, room_name: &str, sid: &str, at: DateTime<Utc>) {
        let mut state = locks::lock(&self.state);
        let session = state.active_mut(room_name, sid, at);
        session.current_participants = session.current_participants.saturating_sub(1);
    }

    /// Close the session. Returns it if one was open.
    pub fn room_finished(&self, room_name: &str, at: DateTime<Utc>) -> Option<RoomSession> {
        let mut state = locks::lock(&self.state);
        let mut session = state.active.remove(room_name)?;
        session.ended_at = Some(at);
        session.current_participants = 0;
        state.finished.push(session.clone());
        if state.finished.len() > MAX_FINISHED_SESSIONS {
            let excess = state.finished.len() - MAX_FINISHED_SESSIONS;
            state.finished.drain(..excess);
        }
        Some(session)
    }

    /// Feed one webhook event into the ledger. Returns false for events that
    /// carry no room or are not tracked.
    pub fn apply(&self, event: &MediaEvent) -> bool {
        let Some(room) = &event.room else {
            return false;
        };
        let at = event.occurred_at();
        match event.event.as_str() {
            "room_started" => self.room_started(&room.name, &room.sid, at),
            "room_finished" => {
                self.room_finished(&room.name, at);
            }
            "participant_joined" if event.participant.is_some() => {
                self.participant_joined(&room.name, &room.sid, at)
            }
            "participant_left" if event.participant.is_some() => {
                self.participant_left(&room.name, &room.sid, at)
            }
            _ => return false,
        }
        true
    }

    pub fn active(&self) -> Vec<RoomSession> {
        let mut sessions: Vec<RoomSession> =
            locks::lock(&self.state).active.values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Newest first.
    pub fn finished(&self, limit: usize) -> Vec<RoomSession> {
        locks::lock(&self.state)
            .finished
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}
