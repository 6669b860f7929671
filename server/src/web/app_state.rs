use std::sync::Arc;
use std::time::Duration;

use crate::auth::media_token::WebhookVerifier;
use crate::engine::voice_engine::VoiceEngine;

use super::rate_limit::ApiRateLimiters;

/// Socket deadlines for WebSocket connections.
#[derive(Debug, Clone)]
pub struct ConnectionTimeouts {
    /// How often the server pings an otherwise quiet client.
    pub ping_interval: Duration,
    /// A connection with no inbound frame for this long is dropped.
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared state handed to every axum handler.
pub struct AppState {
    pub engine: Arc<VoiceEngine>,
    pub webhook_verifier: WebhookVerifier,
    pub timeouts: ConnectionTimeouts,
    /// Per-IP HTTP limiters, swept by a background task.
    pub rate_limiters: Arc<ApiRateLimiters>,
}
