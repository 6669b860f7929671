use thiserror::Error;

/// Every failure an aggregate or use case can report. Each variant maps to a
/// stable wire code via [`EngineError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid room name: {0}")]
    InvalidRoomName(String),

    #[error("room not found")]
    RoomNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("ban not found")]
    BanNotFound,

    #[error("room is full")]
    RoomFull,

    #[error("room is closed")]
    RoomClosed,

    #[error("user is already in this room")]
    UserAlreadyInRoom,

    #[error("user is not in this room")]
    UserNotInRoom,

    #[error("a room named {0:?} already exists")]
    DuplicateRoomName(String),

    #[error("user record already exists")]
    UserAlreadyExists,

    #[error("you are banned from this server")]
    UserBanned,

    #[error("rate limit exceeded, slow down")]
    RateLimited,

    #[error("failed to issue join credential: {0}")]
    Credential(String),

    /// The first step of a two-step mutation succeeded and the second failed.
    #[error("{step} failed after {completed} succeeded: {source}")]
    PartialFailure {
        completed: &'static str,
        step: &'static str,
        source: Box<EngineError>,
    },
}

/// Coarse classification used by transports to pick a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Throttled,
    Infrastructure,
}

impl EngineError {
    /// Stable machine-readable code carried in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "INVALID_PAYLOAD",
            EngineError::InvalidRoomName(_) => "INVALID_ROOM_NAME",
            EngineError::RoomNotFound => "ROOM_NOT_FOUND",
            EngineError::UserNotFound => "USER_NOT_FOUND",
            EngineError::MessageNotFound => "MESSAGE_NOT_FOUND",
            EngineError::BanNotFound => "BAN_NOT_FOUND",
            EngineError::RoomFull => "ROOM_FULL",
            EngineError::RoomClosed => "ROOM_CLOSED",
            EngineError::UserAlreadyInRoom => "ALREADY_IN_ROOM",
            EngineError::UserNotInRoom => "NOT_IN_ROOM",
            EngineError::DuplicateRoomName(_) => "ROOM_EXISTS",
            EngineError::UserAlreadyExists => "USER_EXISTS",
            EngineError::UserBanned => "USER_BANNED",
            EngineError::RateLimited => "RATE_LIMITED",
            EngineError::Credential(_) => "TOKEN_FAILED",
            EngineError::PartialFailure { .. } => "PARTIAL_FAILURE",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Validation(_) | EngineError::InvalidRoomName(_) => ErrorClass::Validation,
            EngineError::RoomNotFound
            | EngineError::UserNotFound
            | EngineError::MessageNotFound
            | EngineError::BanNotFound => ErrorClass::NotFound,
            EngineError::RoomFull
            | EngineError::RoomClosed
            | EngineError::UserAlreadyInRoom
            | EngineError::UserNotInRoom
            | EngineError::DuplicateRoomName(_)
            | EngineError::UserAlreadyExists => ErrorClass::Conflict,
            EngineError::UserBanned => ErrorClass::Forbidden,
            EngineError::RateLimited => ErrorClass::Throttled,
            EngineError::Credential(_) | EngineError::PartialFailure { .. } => {
                ErrorClass::Infrastructure
            }
        }
    }
}

impl From<String> for EngineError {
    fn from(message: String) -> Self {
        EngineError::Validation(message)
    }
}
