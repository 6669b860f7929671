use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Messages kept per room when no limit is configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Sent by a participant.
    #[serde(rename = "chat")]
    User,
    /// Join/leave/moderation notices generated by the server.
    #[serde(rename = "system")]
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// emoji -> user IDs in the order they reacted.
    pub reactions: BTreeMap<String, Vec<String>>,
}

impl ChatMessage {
    pub fn user(room_id: &str, sender_id: &str, sender_name: &str, content: &str) -> Self {
        Self::build(room_id, MessageKind::User, sender_id, sender_name, content)
    }

    /// A server notice about `subject`, e.g. "joined the room".
    pub fn system(room_id: &str, subject_id: &str, subject_name: &str, content: &str) -> Self {
        Self::build(room_id, MessageKind::System, subject_id, subject_name, content)
    }

    fn build(
        room_id: &str,
        kind: MessageKind,
        sender_id: &str,
        sender_name: &str,
        content: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            kind,
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            reactions: BTreeMap::new(),
        }
    }

    /// Add `user_id` under `emoji`. Repeats are no-ops.
    pub fn add_reaction(&mut self, emoji: &str, user_id: &str) -> bool {
        let reactors = self.reactions.entry(emoji.to_string()).or_default();
        if reactors.iter().any(|u| u == user_id) {
            return false;
        }
        reactors.push(user_id.to_string());
        true
    }

    /// Remove `user_id` from `emoji`, dropping the emoji once nobody is left.
    pub fn remove_reaction(&mut self, emoji: &str, user_id: &str) -> bool {
        let Some(reactors) = self.reactions.get_mut(emoji) else {
            return false;
        };
        let before = reactors.len();
        reactors.retain(|u| u != user_id);
        let removed = reactors.len() != before;
        if reactors.is_empty() {
            self.reactions.remove(emoji);
        }
        removed
    }

    pub fn reactors(&self, emoji: &str) -> Vec<String> {
        self.reactions.get(emoji).cloned().unwrap_or_default()
    }
}

/// Per-room bounded history with O(1) lookup by message ID.
///
/// Messages carry a per-room sequence number; the index maps ID to sequence
/// and a message's slot in the deque is `seq - front_seq`.
#[derive(Default)]
struct RoomLog {
    messages: VecDeque<ChatMessage>,
    index: HashMap<String, u64>,
    front_seq: u64,
}

impl RoomLog {
    fn push(&mut self, message: ChatMessage, limit: usize) {
        let seq = self.front_seq + self.messages.len() as u64;
        self.index.insert(message.id.clone(), seq);
        self.messages.push_back(message);
        while self.messages.len() > limit {
            self.pop_front();
        }
    }

    fn pop_front(&mut self) -> Option<ChatMessage> {
        let oldest = self.messages.pop_front()?;
        self.index.remove(&oldest.id);
        self.front_seq += 1;
        Some(oldest)
    }

    fn find_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        let seq = *self.index.get(message_id)?;
        let slot = usize::try_from(seq.checked_sub(self.front_seq)?).ok()?;
        self.messages.get_mut(slot)
    }
}

/// Chat history for every room.
pub struct ChatLedger {
    rooms: DashMap<String, RoomLog>,
    limit: usize,
}

impl Default for ChatLedger {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ChatLedger {
    pub fn new(limit: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append, evicting the oldest message once the room is over the limit.
    pub fn append(&self, message: ChatMessage) {
        self.rooms
            .entry(message.room_id.clone())
            .or_default()
            .push(message, self.limit);
    }

    /// The last `limit` messages, oldest first. `0` means everything.
    pub fn recent(&self, room_id: &str, limit: usize) -> Vec<ChatMessage> {
        let Some(log) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        let skip = if limit == 0 {
            0
        } else {
            log.messages.len().saturating_sub(limit)
        };
        log.messages.iter().skip(skip).cloned().collect()
    }

    pub fn get(&self, room_id: &str, message_id: &str) -> Result<ChatMessage, EngineError> {
        self.mutate(room_id, message_id, |m| m.clone())
    }

    /// Run `f` on a stored message under the room's shard lock.
    pub fn mutate<R>(
        &self,
        room_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut ChatMessage) -> R,
    ) -> Result<R, EngineError> {
        let mut log = self
            .rooms
            .get_mut(room_id)
            .ok_or(EngineError::MessageNotFound)?;
        let message = log
            .find_mut(message_id)
            .ok_or(EngineError::MessageNotFound)?;
        Ok(f(message))
    }

    /// Add a reaction and return the reactor list for that emoji.
    pub fn add_reaction(
        &self,
        room_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        self.mutate(room_id, message_id, |m| {
            m.add_reaction(emoji, user_id);
            m.reactors(emoji)
        })
    }

    pub fn remove_reaction(
        &self,
        room_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        self.mutate(room_id, message_id, |m| {
            m.remove_reaction(emoji, user_id);
            m.reactors(emoji)
        })
    }

    pub fn delete_room_messages(&self, room_id: &str) -> usize {
        self.rooms
            .remove(room_id)
            .map(|(_, log)| log.messages.len())
            .unwrap_or(0)
    }

    /// Drop messages older than `cutoff` in every room. Returns how many went.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut log in self.rooms.iter_mut() {
            while log
                .messages
                .front()
                .is_some_and(|m| m.timestamp < cutoff)
            {
                log.pop_front();
                removed += 1;
            }
        }
        self.rooms.retain(|_, log| !log.messages.is_empty());
        removed
    }

    pub fn len(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|l| l.messages.len()).unwrap_or(0)
    }
}
