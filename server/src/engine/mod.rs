pub mod activity;
pub mod analytics;
pub mod ban;
pub mod chat;
pub mod error;
pub mod events;
mod locks;
pub mod moderation;
pub mod names;
pub mod presence;
pub mod rate_limiter;
pub mod reaper;
pub mod registry;
pub mod room;
pub mod room_service;
pub mod room_store;
pub mod user;
pub mod validation;
pub mod voice_engine;
