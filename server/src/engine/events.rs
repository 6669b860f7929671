use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::chat::ChatMessage;
use super::error::EngineError;
use super::room::RoomType;
use super::user::VoiceMode;

/// Unique identifier for a live connection (one per socket, not per user).
pub type ConnectionId = Uuid;

/// Outbound event pushed to a connection. Serialized as an adjacently
/// tagged envelope: `{"type": ..., "payload": {...}, "timestamp": ...}`.
/// Variants without data omit the payload entirely.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First event on every connection.
    Connected { message: String, user_id: String },

    RoomJoined(RoomJoined),

    RoomLeft,

    RoomList { rooms: Vec<RoomSummary> },

    RoomInfo(RoomInfo),

    /// Recent chat backlog sent right after `room_joined`.
    ChatHistory { messages: Vec<ChatMessage> },

    ChatMessage { message: ChatMessage },

    /// Full reactor list for one emoji after an add or remove.
    ChatReaction {
        message_id: String,
        emoji: String,
        user_id: String,
        user_ids: Vec<String>,
    },

    UserJoined {
        room_id: String,
        user_id: String,
        user_name: String,
        participant: ParticipantInfo,
    },

    UserLeft {
        room_id: String,
        user_id: String,
        user_name: String,
    },

    UserMuted {
        user_id: String,
        user_name: String,
        is_muted: bool,
    },

    /// The receiver just became the only occupant of its room.
    PlayTestTone,

    /// The receiver is no longer alone.
    StopTestTone,

    Kicked { reason: String },

    Banned {
        reason: String,
        duration_minutes: i64,
    },

    RoomClosed { room_id: String, room_name: String },

    AdminAuthResult { success: bool, message: String },

    Error { code: String, message: String },

    Ping,

    Pong,
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Render the wire envelope, stamping the send time.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        self.to_wire_at(Utc::now())
    }

    pub fn to_wire_at(&self, timestamp: DateTime<Utc>) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(envelope) = &mut value {
            envelope.insert(
                "timestamp".into(),
                Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        serde_json::to_string(&value)
    }

    /// The wire `type` discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::RoomJoined(_) => "room_joined",
            ServerEvent::RoomLeft => "room_left",
            ServerEvent::RoomList { .. } => "room_list",
            ServerEvent::RoomInfo(_) => "room_info",
            ServerEvent::ChatHistory { .. } => "chat_history",
            ServerEvent::ChatMessage { .. } => "chat_message",
            ServerEvent::ChatReaction { .. } => "chat_reaction",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::UserMuted { .. } => "user_muted",
            ServerEvent::PlayTestTone => "play_test_tone",
            ServerEvent::StopTestTone => "stop_test_tone",
            ServerEvent::Kicked { .. } => "kicked",
            ServerEvent::Banned { .. } => "banned",
            ServerEvent::RoomClosed { .. } => "room_closed",
            ServerEvent::AdminAuthResult { .. } => "admin_auth_result",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Ping => "ping",
            ServerEvent::Pong => "pong",
        }
    }
}

impl From<&EngineError> for ServerEvent {
    fn from(err: &EngineError) -> Self {
        ServerEvent::error(err.code(), err.to_string())
    }
}

/// Payload of `room_joined`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomJoined {
    pub room_id: String,
    pub room_name: String,
    pub user_id: String,
    /// May differ from the requested name after collision resolution.
    pub user_name: String,
    pub join_credential: String,
    pub media_server_url: String,
    /// Other participants the joiner is allowed to see.
    pub participants: Vec<ParticipantInfo>,
    pub is_new_room: bool,
}

/// Participant as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
    pub voice_mode: VoiceMode,
    pub is_muted: bool,
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
}

/// Row of the public room list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub participant_count: usize,
    pub capacity: usize,
    pub is_full: bool,
}

/// Preview of a single room, used by `get_room`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub capacity: usize,
    pub participant_count: usize,
    pub participants: Vec<ParticipantInfo>,
    pub can_join: bool,
    pub is_closed: bool,
}

// ── Inbound ─────────────────────────────────────────────────────────

/// Decoded inbound message. The `type` discriminator is read first and the
/// payload is then decoded against that variant's schema only.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinRoom(JoinRoomRequest),
    LeaveRoom,
    ListRooms,
    GetRoom(GetRoomRequest),
    ChatMessage(ChatMessageRequest),
    ChatReactionAdd(ReactionRequest),
    ChatReactionRemove(ReactionRequest),
    Ping,
    Pong,
    AdminAuth(AdminAuthRequest),
    MuteSelf(MuteSelfRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinRoomRequest {
    pub room_name: String,
    pub user_name: String,
    #[serde(default)]
    pub voice_mode: VoiceMode,
    /// Honored only on connections that passed `admin_auth`.
    #[serde(default)]
    pub stealth: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GetRoomRequest {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactionRequest {
    pub message_id: String,
    pub emoji: String,
}

#[derive(Clone, PartialEq, Deserialize)]
pub struct AdminAuthRequest {
    pub password: String,
}

impl std::fmt::Debug for AdminAuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuthRequest")
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MuteSelfRequest {
    pub muted: bool,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl DecodeError {
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::UnknownType(_) => "UNKNOWN_TYPE",
            DecodeError::Malformed(_) | DecodeError::InvalidPayload { .. } => "INVALID_PAYLOAD",
        }
    }
}

impl From<&DecodeError> for ServerEvent {
    fn from(err: &DecodeError) -> Self {
        ServerEvent::error(err.code(), err.to_string())
    }
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let envelope: InboundEnvelope =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kind = envelope.kind.as_str();
        let payload = envelope
            .payload
            .filter(|p| !p.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));

        match kind {
            "join_room" => decode_payload(kind, payload).map(ClientMessage::JoinRoom),
            "leave_room" => Ok(ClientMessage::LeaveRoom),
            "list_rooms" | "get_rooms" => Ok(ClientMessage::ListRooms),
            "get_room" => decode_payload(kind, payload).map(ClientMessage::GetRoom),
            "chat_message" => decode_payload(kind, payload).map(ClientMessage::ChatMessage),
            "chat_reaction_add" => {
                decode_payload(kind, payload).map(ClientMessage::ChatReactionAdd)
            }
            "chat_reaction_remove" => {
                decode_payload(kind, payload).map(ClientMessage::ChatReactionRemove)
            }
            "ping" => Ok(ClientMessage::Ping),
            "pong" => Ok(ClientMessage::Pong),
            "admin_auth" => decode_payload(kind, payload).map(ClientMessage::AdminAuth),
            "mute_self" => decode_payload(kind, payload).map(ClientMessage::MuteSelf),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

fn decode_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|e| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join_room() {
        let msg = ClientMessage::decode(
            r#"{"type":"join_room","payload":{"room_name":"Lobby","user_name":"alice","voice_mode":"vad"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom(JoinRoomRequest {
                room_name: "Lobby".into(),
                user_name: "alice".into(),
                voice_mode: VoiceMode::Vad,
                stealth: false,
            })
        );
    }

    #[test]
    fn test_decode_payloadless_types() {
        assert_eq!(
            ClientMessage::decode(r#"{"type":"leave_room"}"#).unwrap(),
            ClientMessage::LeaveRoom
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"leave_room","payload":{}}"#).unwrap(),
            ClientMessage::LeaveRoom
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"get_rooms","payload":null}"#).unwrap(),
            ClientMessage::ListRooms
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_decode_get_room_by_name_or_id() {
        let by_name =
            ClientMessage::decode(r#"{"type":"get_room","payload":{"room_name":"x"}}"#).unwrap();
        assert_eq!(
            by_name,
            ClientMessage::GetRoom(GetRoomRequest {
                room_id: None,
                room_name: Some("x".into()),
            })
        );
    }

    #[test]
    fn test_decode_errors() {
        let err = ClientMessage::decode("not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");

        let err = ClientMessage::decode(r#"{"type":"dance"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "dance"));
        assert_eq!(err.code(), "UNKNOWN_TYPE");

        // Payload shape is checked against the declared type only.
        let err = ClientMessage::decode(r#"{"type":"chat_message","payload":{"text":"hi"}}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { ref kind, .. } if kind == "chat_message"));

        let err = ClientMessage::decode(r#"{"type":"join_room"}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn test_admin_password_not_in_debug_output() {
        let msg = ClientMessage::decode(r#"{"type":"admin_auth","payload":{"password":"hunter2"}}"#)
            .unwrap();
        assert!(!format!("{msg:?}").contains("hunter2"));
    }

    #[test]
    fn test_wire_envelope_shape() {
        let event = ServerEvent::error("ROOM_FULL", "room is full");
        let wire: Value = serde_json::from_str(&event.to_wire().unwrap()).unwrap();
        assert_eq!(wire["type"], "error");
        assert_eq!(wire["payload"], json!({"code": "ROOM_FULL", "message": "room is full"}));
        assert!(wire["timestamp"].is_string());
    }

    #[test]
    fn test_empty_payload_is_omitted() {
        let wire: Value = serde_json::from_str(&ServerEvent::RoomLeft.to_wire().unwrap()).unwrap();
        assert_eq!(wire["type"], "room_left");
        assert!(wire.get("payload").is_none());

        let wire: Value =
            serde_json::from_str(&ServerEvent::PlayTestTone.to_wire().unwrap()).unwrap();
        assert_eq!(wire["type"], "play_test_tone");
        assert_eq!(ServerEvent::PlayTestTone.kind(), "play_test_tone");
    }

    #[test]
    fn test_room_list_uses_type_field() {
        let event = ServerEvent::RoomList {
            rooms: vec![RoomSummary {
                id: "r1".into(),
                name: "Lobby".into(),
                room_type: RoomType::Public,
                participant_count: 2,
                capacity: 15,
                is_full: false,
            }],
        };
        let wire: Value = serde_json::from_str(&event.to_wire().unwrap()).unwrap();
        assert_eq!(wire["payload"]["rooms"][0]["type"], "public");
        assert_eq!(wire["payload"]["rooms"][0]["participant_count"], 2);
    }

    #[test]
    fn test_engine_error_to_event() {
        let event = ServerEvent::from(&EngineError::RoomClosed);
        assert_eq!(
            event,
            ServerEvent::Error {
                code: "ROOM_CLOSED".into(),
                message: "room is closed".into(),
            }
        );
    }
}
