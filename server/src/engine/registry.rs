use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

use super::events::{ConnectionId, ServerEvent};
use super::locks;

/// Maximum queued outbound events per connection (slow-client protection).
pub const MAX_OUTBOUND_QUEUE: usize = 256;

/// A live client connection. Protocol-agnostic; the transport owns the
/// receiving end of `outbound` and drains it from a single writer task, so
/// pushes to one connection are delivered in order.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Participant identity assigned at connect time.
    pub user_id: String,
    pub ip: String,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<ServerEvent>,
    is_admin: AtomicBool,
    tone_playing: AtomicBool,
}

impl Connection {
    pub fn new(ip: impl Into<String>) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(MAX_OUTBOUND_QUEUE);
        let conn = Self {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4().to_string(),
            ip: ip.into(),
            connected_at: Utc::now(),
            outbound: tx,
            is_admin: AtomicBool::new(false),
            tone_playing: AtomicBool::new(false),
        };
        (conn, rx)
    }

    /// Queue an event. Returns false if the writer is gone or the queue is
    /// full; a full queue drops the event rather than blocking the sender.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(conn_id = %self.id, kind = event.kind(), "outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin.load(Ordering::Acquire)
    }

    pub fn set_admin(&self, is_admin: bool) {
        self.is_admin.store(is_admin, Ordering::Release);
    }

    /// Edge-trigger state for the "alone in room" tone.
    pub(crate) fn tone_flag(&self) -> &AtomicBool {
        &self.tone_playing
    }

    /// Forget the tone state when leaving a room.
    pub(crate) fn reset_presence(&self) {
        self.tone_playing.store(false, Ordering::Release);
    }
}

/// What a presence poller sees when it checks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The connection is gone, or has left/rejoined since the poller started.
    Gone,
    Occupancy(usize),
}

#[derive(Debug)]
struct Membership {
    handle: Arc<Connection>,
    room_id: Option<String>,
    /// Bumped on every room entry so stale pollers can tell they are stale.
    epoch: u64,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Membership>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
    next_epoch: u64,
}

impl RegistryState {
    fn detach(&mut self, conn_id: ConnectionId) -> Option<String> {
        let membership = self.connections.get_mut(&conn_id)?;
        let room_id = membership.room_id.take()?;
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some(room_id)
    }

    fn handles(&self, ids: impl Iterator<Item = ConnectionId>) -> Vec<Arc<Connection>> {
        ids.filter_map(|id| self.connections.get(&id).map(|m| m.handle.clone()))
            .collect()
    }
}

/// Live connections and which room each one is in, under one lock.
///
/// Fan-out snapshots the recipients under the read lock and pushes after
/// releasing it.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<Connection>) {
        locks::write(&self.state).connections.insert(
            conn.id,
            Membership {
                handle: conn,
                room_id: None,
                epoch: 0,
            },
        );
    }

    /// Remove a connection. Returns its handle and the room it was in.
    pub fn unregister(&self, conn_id: ConnectionId) -> Option<(Arc<Connection>, Option<String>)> {
        let mut state = locks::write(&self.state);
        let room_id = state.detach(conn_id);
        let membership = state.connections.remove(&conn_id)?;
        Some((membership.handle, room_id))
    }

    /// Put a connection in a room, leaving any previous one. Returns the new
    /// membership epoch and the room's occupancy including this connection.
    pub fn enter_room(&self, conn_id: ConnectionId, room_id: &str) -> Option<(u64, usize)> {
        let mut state = locks::write(&self.state);
        if !state.connections.contains_key(&conn_id) {
            return None;
        }
        state.detach(conn_id);

        state.next_epoch += 1;
        let epoch = state.next_epoch;
        if let Some(membership) = state.connections.get_mut(&conn_id) {
            membership.room_id = Some(room_id.to_string());
            membership.epoch = epoch;
        }
        let members = state.rooms.entry(room_id.to_string()).or_default();
        members.insert(conn_id);
        Some((epoch, members.len()))
    }

    /// Move a connection back to the lobby. Returns the room it left.
    pub fn leave_room(&self, conn_id: ConnectionId) -> Option<String> {
        locks::write(&self.state).detach(conn_id)
    }

    /// Move every connection in `room_id` back to the lobby.
    pub fn evict_room(&self, room_id: &str) -> Vec<Arc<Connection>> {
        let mut state = locks::write(&self.state);
        let Some(members) = state.rooms.remove(room_id) else {
            return Vec::new();
        };
        let mut evicted = Vec::with_capacity(members.len());
        for conn_id in members {
            if let Some(membership) = state.connections.get_mut(&conn_id) {
                membership.room_id = None;
                evicted.push(membership.handle.clone());
            }
        }
        evicted
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        locks::read(&self.state)
            .connections
            .get(&conn_id)
            .map(|m| m.handle.clone())
    }

    pub fn find_by_user(&self, user_id: &str) -> Option<Arc<Connection>> {
        locks::read(&self.state)
            .connections
            .values()
            .find(|m| m.handle.user_id == user_id)
            .map(|m| m.handle.clone())
    }

    pub fn room_of(&self, conn_id: ConnectionId) -> Option<String> {
        locks::read(&self.state)
            .connections
            .get(&conn_id)
            .and_then(|m| m.room_id.clone())
    }

    pub fn occupancy(&self, room_id: &str) -> usize {
        locks::read(&self.state)
            .rooms
            .get(room_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Occupancy of `room_id` as seen by a poller started at `epoch`.
    pub fn presence(&self, conn_id: ConnectionId, room_id: &str, epoch: u64) -> Presence {
        let state = locks::read(&self.state);
        match state.connections.get(&conn_id) {
            Some(m) if m.epoch == epoch && m.room_id.as_deref() == Some(room_id) => {
                Presence::Occupancy(state.rooms.get(room_id).map(HashSet::len).unwrap_or(0))
            }
            _ => Presence::Gone,
        }
    }

    pub fn is_registered(&self, conn_id: ConnectionId) -> bool {
        locks::read(&self.state).connections.contains_key(&conn_id)
    }

    pub fn room_members(&self, room_id: &str) -> Vec<Arc<Connection>> {
        let state = locks::read(&self.state);
        match state.rooms.get(room_id) {
            Some(members) => state.handles(members.iter().copied()),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        locks::read(&self.state).connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    pub fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        match self.get(conn_id) {
            Some(conn) => conn.send(event),
            None => false,
        }
    }

    /// Push to everyone in a room except `exclude`. Returns recipients reached.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let recipients = self.room_members(room_id);
        deliver(recipients, event, exclude)
    }

    /// Push to every connection that is not in a room.
    pub fn broadcast_to_lobby(&self, event: &ServerEvent) -> usize {
        let recipients = {
            let state = locks::read(&self.state);
            state
                .connections
                .values()
                .filter(|m| m.room_id.is_none())
                .map(|m| m.handle.clone())
                .collect::<Vec<_>>()
        };
        deliver(recipients, event, None)
    }
}

fn deliver(
    recipients: Vec<Arc<Connection>>,
    event: &ServerEvent,
    exclude: Option<ConnectionId>,
) -> usize {
    recipients
        .into_iter()
        .filter(|c| Some(c.id) != exclude)
        .filter(|c| c.send(event.clone()))
        .count()
}
