use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bitflags::bitflags;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default lifetime of a join credential.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

bitflags! {
    /// Capabilities granted to a participant inside a media-server room.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Grants: u8 {
        const JOIN          = 1 << 0;
        const PUBLISH       = 1 << 1;
        const SUBSCRIBE     = 1 << 2;
        const PUBLISH_DATA  = 1 << 3;
        /// Not announced to other participants.
        const HIDDEN        = 1 << 4;
        const ROOM_ADMIN    = 1 << 5;
    }
}

impl Grants {
    /// Regular speaking participant.
    pub const PARTICIPANT: Self = Self::JOIN
        .union(Self::PUBLISH)
        .union(Self::SUBSCRIBE)
        .union(Self::PUBLISH_DATA);

    /// Stealth admins listen without publishing or being announced.
    pub fn for_participant(is_admin: bool, is_stealth: bool) -> Self {
        match (is_admin, is_stealth) {
            (true, true) => Self::JOIN | Self::SUBSCRIBE | Self::HIDDEN | Self::ROOM_ADMIN,
            (true, false) => Self::PARTICIPANT | Self::ROOM_ADMIN,
            (false, _) => Self::PARTICIPANT,
        }
    }
}

/// What the credential should allow.
#[derive(Debug, Clone)]
pub struct CredentialRequest<'a> {
    pub room_name: &'a str,
    pub user_id: &'a str,
    pub user_name: &'a str,
    pub grants: Grants,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("media server API key/secret not configured")]
    NotConfigured,
    #[error("signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Produces credentials clients present to the media server.
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, request: &CredentialRequest<'_>) -> Result<String, CredentialError>;

    /// URL clients should connect to with the credential.
    fn media_server_url(&self) -> &str;
}

/// Room grant in the media server's token format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
    pub hidden: bool,
    pub room_admin: bool,
}

impl VideoGrant {
    fn new(room: &str, grants: Grants) -> Self {
        Self {
            room: room.to_string(),
            room_join: grants.contains(Grants::JOIN),
            can_publish: grants.contains(Grants::PUBLISH),
            can_subscribe: grants.contains(Grants::SUBSCRIBE),
            can_publish_data: grants.contains(Grants::PUBLISH_DATA),
            hidden: grants.contains(Grants::HIDDEN),
            room_admin: grants.contains(Grants::ROOM_ADMIN),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaClaims {
    pub iss: String,
    pub sub: String,
    pub name: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: VideoGrant,
}

/// HS256 join credentials signed with the media server's API secret.
pub struct MediaTokenIssuer {
    api_key: String,
    api_secret: String,
    url: String,
    ttl: Duration,
}

impl MediaTokenIssuer {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            url: url.into(),
            ttl: Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Decode and check a credential this issuer produced.
    pub fn verify(&self, token: &str) -> Result<MediaClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.api_key]);
        let data = decode::<MediaClaims>(
            token,
            &DecodingKey::from_secret(self.api_secret.as_bytes()),
            &validation,
        )?;
        Ok(data.claims)
    }
}

impl CredentialIssuer for MediaTokenIssuer {
    fn issue(&self, request: &CredentialRequest<'_>) -> Result<String, CredentialError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(CredentialError::NotConfigured);
        }

        let now = Utc::now();
        let claims = MediaClaims {
            iss: self.api_key.clone(),
            sub: request.user_id.to_string(),
            name: request.user_name.to_string(),
            nbf: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            video: VideoGrant::new(request.room_name, request.grants),
        };

        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.api_secret.as_bytes()),
        )?)
    }

    fn media_server_url(&self) -> &str {
        &self.url
    }
}

// ── Webhook verification ────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookAuthError {
    #[error("missing authorization header")]
    MissingToken,
    #[error("invalid webhook token")]
    InvalidToken,
    #[error("body hash does not match token")]
    HashMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WebhookClaims {
    iss: String,
    exp: i64,
    sha256: String,
}

/// Checks that webhook calls were signed by the media server: the bearer
/// token is an HS256 JWT whose `sha256` claim is the base64 SHA-256 of the body.
#[derive(Clone)]
pub struct WebhookVerifier {
    api_key: String,
    api_secret: String,
}

impl WebhookVerifier {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn verify(&self, authorization: Option<&str>, body: &[u8]) -> Result<(), WebhookAuthError> {
        let token = authorization
            .map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim())
            .filter(|t| !t.is_empty())
            .ok_or(WebhookAuthError::MissingToken)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.api_key]);
        let claims = decode::<WebhookClaims>(
            token,
            &DecodingKey::from_secret(self.api_secret.as_bytes()),
            &validation,
        )
        .map_err(|_| WebhookAuthError::InvalidToken)?
        .claims;

        if claims.sha256 != body_hash(body) {
            return Err(WebhookAuthError::HashMismatch);
        }
        Ok(())
    }

    /// Sign a body the way the media server does. Used by tests and tooling.
    pub fn sign(&self, body: &[u8]) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = WebhookClaims {
            iss: self.api_key.clone(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
            sha256: body_hash(body),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.api_secret.as_bytes()),
        )
    }
}

fn body_hash(body: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(body))
}
