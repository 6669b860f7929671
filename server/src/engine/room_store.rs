use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use super::error::EngineError;
use super::locks;
use super::room::{Room, RoomType};

/// The room collection. Its lock guards only structure (create, delete,
/// name lookups); each room guards its own membership.
#[derive(Default)]
pub struct RoomStore {
    index: RwLock<RoomIndex>,
}

#[derive(Default)]
struct RoomIndex {
    by_id: HashMap<String, Arc<Room>>,
    id_by_name: HashMap<String, String>,
}

impl RoomIndex {
    fn insert(&mut self, room: Arc<Room>) {
        self.id_by_name.insert(room.name.clone(), room.id.clone());
        self.by_id.insert(room.id.clone(), room);
    }
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new room. Names are unique across the store.
    pub fn create(&self, room: Room) -> Result<Arc<Room>, EngineError> {
        let mut index = locks::write(&self.index);
        if index.id_by_name.contains_key(&room.name) {
            return Err(EngineError::DuplicateRoomName(room.name));
        }
        let room = Arc::new(room);
        index.insert(room.clone());
        Ok(room)
    }

    /// Look up by name, creating through `make` if missing. The check and the
    /// insert happen under one write lock so racing joins share one room. A
    /// retired room still waiting for removal is replaced under its name.
    pub fn get_or_create(&self, name: &str, make: impl FnOnce() -> Room) -> (Arc<Room>, bool) {
        if let Some(room) = self.get_by_name(name) {
            return (room, false);
        }

        let mut index = locks::write(&self.index);
        if let Some(room) = index
            .id_by_name
            .get(name)
            .and_then(|id| index.by_id.get(id))
            .filter(|r| !r.is_retired())
        {
            return (room.clone(), false);
        }
        let room = Arc::new(make());
        index.insert(room.clone());
        (room, true)
    }

    pub fn get_by_id(&self, room_id: &str) -> Result<Arc<Room>, EngineError> {
        locks::read(&self.index)
            .by_id
            .get(room_id)
            .cloned()
            .ok_or(EngineError::RoomNotFound)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Room>> {
        let index = locks::read(&self.index);
        index
            .id_by_name
            .get(name)
            .and_then(|id| index.by_id.get(id))
            .filter(|r| !r.is_retired())
            .cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        locks::read(&self.index).id_by_name.contains_key(name)
    }

    pub fn delete(&self, room_id: &str) -> Result<Arc<Room>, EngineError> {
        let mut index = locks::write(&self.index);
        let room = index
            .by_id
            .remove(room_id)
            .ok_or(EngineError::RoomNotFound)?;
        if index.id_by_name.get(&room.name) == Some(&room.id) {
            index.id_by_name.remove(&room.name);
        }
        Ok(room)
    }

    /// Every room, oldest first.
    pub fn all(&self) -> Vec<Arc<Room>> {
        let mut rooms: Vec<Arc<Room>> = locks::read(&self.index).by_id.values().cloned().collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        rooms
    }

    /// Rooms shown in the public list: public and not closed.
    pub fn public_rooms(&self) -> Vec<Arc<Room>> {
        self.all()
            .into_iter()
            .filter(|r| r.room_type == RoomType::Public && !r.is_closed() && !r.is_retired())
            .collect()
    }

    /// Empty user-created rooms idle longer than `idle` as of `now`.
    pub fn idle_empty_rooms(&self, idle: Duration, now: DateTime<Utc>) -> Vec<Arc<Room>> {
        self.all()
            .into_iter()
            .filter(|r| !r.created_by.is_admin() && r.is_empty() && r.idle_for(now) > idle)
            .collect()
    }

    pub fn len(&self) -> usize {
        locks::read(&self.index).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
