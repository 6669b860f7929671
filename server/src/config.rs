use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use crate::engine::reaper::ReaperSchedule;
use crate::engine::voice_engine::EngineSettings;

/// Top-level server configuration, loaded from parley.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub media: MediaSection,
    pub admin: AdminSection,
    pub rooms: RoomsSection,
    pub chat: ChatSection,
    pub activity: ActivitySection,
    pub connection: ConnectionSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub web_address: String,
    pub log_level: String,
    /// CORS origins. `*` allows any.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
            log_level: "info".into(),
            allowed_origins: vec!["*".into()],
        }
    }
}

/// The external media server that carries the audio.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub token_ttl_hours: i64,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:7880".into(),
            api_key: "devkey".into(),
            api_secret: "secret".into(),
            token_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub password: String,
    /// Empty means any address may try the password.
    pub allowed_ips: Vec<String>,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            password: "admin123".into(),
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RoomsSection {
    pub default_capacity: usize,
    pub cleanup_minutes: u64,
    pub lobby_name: String,
    pub lobby_capacity: usize,
}

impl Default for RoomsSection {
    fn default() -> Self {
        Self {
            default_capacity: 15,
            cleanup_minutes: 10,
            lobby_name: "Lobby".into(),
            lobby_capacity: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    pub history_limit: usize,
    pub retention_hours: i64,
    pub max_message_length: usize,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            history_limit: 100,
            retention_hours: 24,
            max_message_length: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ActivitySection {
    pub retention_hours: i64,
}

impl Default for ActivitySection {
    fn default() -> Self {
        Self {
            retention_hours: 48,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub ping_interval_secs: u64,
    pub presence_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: 20,
            presence_interval_secs: 5,
            idle_timeout_secs: 60,
            write_timeout_secs: 10,
        }
    }
}

impl ConnectionSection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }
}

impl ServerConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Self::parse(&contents).with_context(|| format!("failed to parse config file {path}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Apply overrides from any key/value source. Unparseable numbers are ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("WEB_ADDRESS") {
            self.server.web_address = v;
        } else if let Some(port) = var("SERVER_PORT") {
            let host = var("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into());
            self.server.web_address = format!("{host}:{port}");
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Some(v) = var("ALLOWED_ORIGINS") {
            self.server.allowed_origins = split_list(&v);
        }
        if let Some(v) = var("LIVEKIT_URL") {
            self.media.url = v;
        }
        if let Some(v) = var("LIVEKIT_API_KEY") {
            self.media.api_key = v;
        }
        if let Some(v) = var("LIVEKIT_API_SECRET") {
            self.media.api_secret = v;
        }
        if let Some(v) = var("TOKEN_TTL_HOURS")
            && let Ok(hours) = v.parse()
        {
            self.media.token_ttl_hours = hours;
        }
        if let Some(v) = var("ADMIN_PASSWORD") {
            self.admin.password = v;
        }
        if let Some(v) = var("ADMIN_ALLOWED_IPS") {
            self.admin.allowed_ips = split_list(&v);
        }
        if let Some(v) = var("DEFAULT_ROOM_CAPACITY")
            && let Ok(capacity) = v.parse()
        {
            self.rooms.default_capacity = capacity;
        }
        if let Some(v) = var("ROOM_CLEANUP_MINUTES")
            && let Ok(minutes) = v.parse()
        {
            self.rooms.cleanup_minutes = minutes;
        }
        if let Some(v) = var("CHAT_RETENTION_HOURS")
            && let Ok(hours) = v.parse()
        {
            self.chat.retention_hours = hours;
        }
        if let Some(v) = var("MAX_MESSAGE_LENGTH")
            && let Ok(len) = v.parse()
        {
            self.chat.max_message_length = len;
        }
        if let Some(v) = var("ACTIVITY_LOG_HOURS")
            && let Ok(hours) = v.parse()
        {
            self.activity.retention_hours = hours;
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_capacity: self.rooms.default_capacity,
            history_limit: self.chat.history_limit,
            max_message_length: self.chat.max_message_length,
            presence_interval: Duration::from_secs(self.connection.presence_interval_secs.max(1)),
            chat_retention: chrono::Duration::hours(self.chat.retention_hours.max(1)),
            activity_retention: chrono::Duration::hours(self.activity.retention_hours.max(1)),
        }
    }

    pub fn reaper_schedule(&self) -> ReaperSchedule {
        ReaperSchedule {
            room_idle: Duration::from_secs(self.rooms.cleanup_minutes.max(1) * 60),
            ..ReaperSchedule::default()
        }
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.media.token_ttl_hours.max(1))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
