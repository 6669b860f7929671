/// Maximum chat message content length (bytes).
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 64;

/// Maximum display name length.
pub const MAX_USER_NAME_LENGTH: usize = 32;

/// Maximum emoji length (bytes). Covers multi-codepoint sequences.
pub const MAX_EMOJI_LENGTH: usize = 32;

/// Maximum ban/kick reason length.
pub const MAX_REASON_LENGTH: usize = 500;

/// Longest ban an admin can issue (one year).
pub const MAX_BAN_MINUTES: i64 = 365 * 24 * 60;

/// Validate a room name. Must be non-blank, at most 64 chars, no control characters.
pub fn validate_room_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Room name cannot be empty".into());
    }
    if name.chars().count() > MAX_ROOM_NAME_LENGTH {
        return Err(format!(
            "Room name too long (max {} characters)",
            MAX_ROOM_NAME_LENGTH
        ));
    }
    if name.chars().any(char::is_control) {
        return Err("Room name cannot contain control characters".into());
    }
    Ok(())
}

/// Validate a display name. Same shape as room names but shorter.
pub fn validate_user_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Name cannot be empty".into());
    }
    if name.chars().count() > MAX_USER_NAME_LENGTH {
        return Err(format!(
            "Name too long (max {} characters)",
            MAX_USER_NAME_LENGTH
        ));
    }
    if name.chars().any(char::is_control) {
        return Err("Name cannot contain control characters".into());
    }
    Ok(())
}

/// Validate message content. Must be non-empty and under the length limit.
pub fn validate_message(content: &str, max_len: usize) -> Result<(), String> {
    if content.trim().is_empty() {
        return Err("Message cannot be empty".into());
    }
    if content.len() > max_len {
        return Err(format!("Message too long (max {} characters)", max_len));
    }
    Ok(())
}

pub fn validate_emoji(emoji: &str) -> Result<(), String> {
    if emoji.trim().is_empty() {
        return Err("Emoji cannot be empty".into());
    }
    if emoji.len() > MAX_EMOJI_LENGTH {
        return Err("Emoji too long".into());
    }
    Ok(())
}

/// Reasons may be empty; only the length is bounded.
pub fn validate_reason(reason: &str) -> Result<(), String> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(format!(
            "Reason too long (max {} characters)",
            MAX_REASON_LENGTH
        ));
    }
    Ok(())
}

pub fn validate_ban_duration(minutes: i64) -> Result<(), String> {
    if minutes <= 0 {
        return Err("Ban duration must be positive".to_string());
    }
    if minutes > MAX_BAN_MINUTES {
        return Err(format!(
            "Ban duration too long (max {} minutes)",
            MAX_BAN_MINUTES
        ));
    }
    Ok(())
}
